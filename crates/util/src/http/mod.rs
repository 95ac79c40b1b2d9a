pub mod parser;
pub mod url_merge;

pub use parser::*;
pub use url_merge::*;

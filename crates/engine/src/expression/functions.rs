//! Expression functions registered by the embedding program.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

/// A custom function; an `Err` message surfaces as an expression error naming the function.
pub type CustomFunction = dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync;

/// Named custom functions, consulted before the builtins of the same name.
#[derive(Clone, Default)]
pub struct Functions {
    table: IndexMap<String, Arc<CustomFunction>>,
}

impl Functions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.table.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CustomFunction>> {
        self.table.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl fmt::Debug for Functions {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_list().entries(self.table.keys()).finish()
    }
}

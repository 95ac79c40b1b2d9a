//! Binding store for a single book run.
//!
//! The store owns everything expressions can observe: `vars`, one result slot
//! per step, the in-flight step's latest outcome (`current`) and the cookie
//! jar. Only the Operator that created it mutates it; evaluators and runners
//! read it through a [`StoreView`].

use std::collections::HashMap;

use runbook_types::{Book, Outcome};
use serde_json::{Map, Value};

use crate::cookie::CookieJar;
use crate::expression::Functions;

static NULL: Value = Value::Null;

/// Mutable per-run state.
#[derive(Debug, Clone, Default)]
pub struct Store {
    vars: Map<String, Value>,
    steps: Vec<Value>,
    aliases: HashMap<String, usize>,
    current: Option<Outcome>,
    cookies: CookieJar,
    functions: Functions,
}

impl Store {
    /// Creates a store with `step_count` empty slots.
    pub fn new(vars: Map<String, Value>, step_count: usize) -> Self {
        Self {
            vars,
            steps: vec![Value::Null; step_count],
            ..Default::default()
        }
    }

    /// Creates a store seeded with the book's variables, slots and aliases.
    pub fn for_book(book: &Book) -> Self {
        let mut store = Self::new(book.vars.clone(), book.steps.len());
        for (index, step) in book.steps.iter().enumerate() {
            if let Some(alias) = &step.alias {
                store.aliases.insert(alias.clone(), index);
            }
        }
        store
    }

    /// Makes `functions` callable from expressions evaluated against this store.
    pub fn with_functions(mut self, functions: Functions) -> Self {
        self.functions = functions;
        self
    }

    /// Overwrites a variable.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    /// Result slots by step index; unrun and skipped steps hold `null`.
    pub fn steps(&self) -> &[Value] {
        &self.steps
    }

    /// Writes `outcome` into slot `index`, replacing whatever a previous write left there.
    ///
    /// Cookies carried by the outcome are merged into the jar.
    pub fn record_step(&mut self, index: usize, outcome: &Outcome) {
        if index >= self.steps.len() {
            self.steps.resize(index + 1, Value::Null);
        }
        self.steps[index] = outcome.data.clone();
        if !outcome.cookies.is_empty() {
            self.cookies.store(&outcome.cookies);
        }
    }

    /// Records the in-flight outcome, if any, into slot `index`.
    pub fn record_current(&mut self, index: usize) -> bool {
        match self.current.take() {
            Some(outcome) => {
                self.record_step(index, &outcome);
                self.current = Some(outcome);
                true
            }
            None => false,
        }
    }

    pub fn set_current(&mut self, outcome: Outcome) {
        self.current = Some(outcome);
    }

    pub fn current_outcome(&self) -> Option<&Outcome> {
        self.current.as_ref()
    }

    pub fn clear_current(&mut self) {
        self.current = None;
    }

    pub fn cookie_jar(&self) -> &CookieJar {
        &self.cookies
    }

    /// Read-only projection; `loop_index` is exposed to expressions as `i`.
    pub fn view(&self, loop_index: Option<u64>) -> StoreView<'_> {
        StoreView { store: self, loop_index }
    }
}

/// Read-only projection of a [`Store`] plus loop-local bindings.
#[derive(Debug, Clone, Copy)]
pub struct StoreView<'s> {
    store: &'s Store,
    loop_index: Option<u64>,
}

impl<'s> StoreView<'s> {
    pub fn vars(&self) -> &'s Map<String, Value> {
        &self.store.vars
    }

    pub fn var(&self, key: &str) -> Option<&'s Value> {
        self.store.vars.get(key)
    }

    pub fn steps(&self) -> &'s [Value] {
        &self.store.steps
    }

    /// Slot `index`; `null` when the step has not produced an outcome or does not exist.
    pub fn step(&self, index: usize) -> &'s Value {
        self.store.steps.get(index).unwrap_or(&NULL)
    }

    pub fn step_by_alias(&self, alias: &str) -> &'s Value {
        self.store
            .aliases
            .get(alias)
            .map(|index| self.step(*index))
            .unwrap_or(&NULL)
    }

    /// Data of the in-flight step's latest outcome; `null` outside a step.
    pub fn current(&self) -> &'s Value {
        self.store.current.as_ref().map(|outcome| &outcome.data).unwrap_or(&NULL)
    }

    pub fn loop_index(&self) -> Option<u64> {
        self.loop_index
    }

    pub fn cookie_jar(&self) -> &'s CookieJar {
        &self.store.cookies
    }

    pub fn functions(&self) -> &'s Functions {
        &self.store.functions
    }
}

//! Parameter context and source layers.
//!
//! # Design Principles
//!
//! - **Fixed precedence**: `Default < Derived < EnvironmentFile < CommandLine`
//! - **Explicit fold**: layers are sorted by precedence and folded into a fresh
//!   context; the order callers hand layers over does not matter
//! - **Right-biased union**: a higher layer replaces the whole value, no deep merge
//! - **Provenance**: every entry remembers the layer it came from, for errors
//! - **No coercion**: typed accessors fail on a tag mismatch instead of converting

use crate::engine::{Lookup, Value};
use crate::error::{Result, SiteUnitError};
use crate::params;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use strum::{Display, EnumIter, EnumString};

/// Where a parameter value came from, lowest precedence first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, EnumIter, Serialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// Built-in and configured defaults, invoking user facts
    Default,
    /// Computed from the application directory
    Derived,
    /// Per-application environment file
    EnvironmentFile,
    /// `key=value` arguments
    CommandLine,
}

/// A value with its provenance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Value,
    pub source: Source,
}

/// A partial context contributed by one source.
#[derive(Debug, Clone)]
pub struct Layer {
    pub source: Source,
    values: BTreeMap<String, Value>,
}

impl Layer {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.values.insert(params::canonical(name), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(&params::canonical(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&params::canonical(name))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Merged parameters used to render one or more artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterContext {
    entries: BTreeMap<String, Entry>,
}

impl ParameterContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `layers` in precedence order. Equal sources keep the given order.
    pub fn from_layers(layers: impl IntoIterator<Item = Layer>) -> Self {
        let mut layers: Vec<Layer> = layers.into_iter().collect();
        layers.sort_by_key(|layer| layer.source);
        layers.into_iter().fold(Self::new(), |mut ctx, layer| {
            let source = layer.source;
            for (name, value) in layer.values {
                ctx.entries.insert(name, Entry { value, source });
            }
            ctx
        })
    }

    /// Set a value; `Undefined` removes the entry.
    pub fn set(&mut self, name: &str, value: impl Into<Value>, source: Source) {
        let value = value.into();
        let name = params::canonical(name);
        if value.is_defined() {
            self.entries.insert(name, Entry { value, source });
        } else {
            self.entries.remove(&name);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Entry> {
        self.entries.remove(&params::canonical(name))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(&params::canonical(name)).map(|e| &e.value)
    }

    pub fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.get(&params::canonical(name))
    }

    pub fn source_of(&self, name: &str) -> Option<Source> {
        self.entry(name).map(|e| e.source)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&params::canonical(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn mismatch(&self, name: &str, expected: &'static str, found: &Value) -> SiteUnitError {
        SiteUnitError::ParameterType {
            name: params::canonical(name),
            expected,
            found: found.type_name(),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.mismatch(name, "string", other)),
        }
    }

    pub fn get_int(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Integer(n)) => Ok(Some(*n)),
            Some(other) => Err(self.mismatch(name, "integer", other)),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.mismatch(name, "boolean", other)),
        }
    }

    pub fn get_path(&self, name: &str) -> Result<Option<&Path>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Path(p)) => Ok(Some(p)),
            Some(other) => Err(self.mismatch(name, "path", other)),
        }
    }

    pub fn get_sequence(&self, name: &str) -> Result<Option<&[Value]>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Sequence(items)) => Ok(Some(items)),
            Some(other) => Err(self.mismatch(name, "sequence", other)),
        }
    }
}

impl Lookup for ParameterContext {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }

    fn entries(&self) -> Vec<(&str, &Value)> {
        self.iter().map(|(name, entry)| (name, &entry.value)).collect()
    }
}

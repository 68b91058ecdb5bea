// src/execution/context.rs

//! Named values handed from one task to the next.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub secret: bool,
}

/// Ordered list of context entries with a name index.
///
/// Adding an existing name replaces its value in place; names are never
/// duplicated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<ContextEntry>", into = "Vec<ContextEntry>")]
pub struct ContextMap {
    entries: Vec<ContextEntry>,
    index: HashMap<String, usize>,
}

impl ContextMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<Value>, secret: bool) {
        let name = name.into();
        let value = value.into();
        match self.index.get(&name) {
            Some(&i) => {
                self.entries[i].value = value;
                self.entries[i].secret = secret;
            }
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push(ContextEntry {
                    name,
                    value,
                    secret,
                });
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ContextEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn delete(&mut self, name: &str) -> Option<ContextEntry> {
        let i = self.index.remove(name)?;
        let removed = self.entries.remove(i);
        self.reindex();
        Some(removed)
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Values by name; secrets are included unmasked.
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }
}

impl From<Vec<ContextEntry>> for ContextMap {
    fn from(entries: Vec<ContextEntry>) -> Self {
        let mut map = ContextMap::new();
        for e in entries {
            map.add(e.name, e.value, e.secret);
        }
        map
    }
}

impl From<ContextMap> for Vec<ContextEntry> {
    fn from(map: ContextMap) -> Self {
        map.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_replaces_by_name() {
        let mut ctx = ContextMap::new();
        ctx.add("a", 1, false);
        ctx.add("b", "x", false);
        ctx.add("a", 2, true);
        assert_eq!(ctx.len(), 2);
        let a = ctx.get("a").unwrap();
        assert_eq!(a.value, Value::from(2));
        assert!(a.secret);
        assert_eq!(ctx.iter().next().unwrap().name, "a");
    }

    #[test]
    fn delete_keeps_index_consistent() {
        let mut ctx = ContextMap::new();
        ctx.add("a", 1, false);
        ctx.add("b", 2, false);
        ctx.add("c", 3, false);
        assert_eq!(ctx.delete("a").unwrap().value, Value::from(1));
        assert!(ctx.delete("a").is_none());
        assert_eq!(ctx.get("c").unwrap().value, Value::from(3));
        assert_eq!(ctx.to_map().len(), 2);
    }
}

use anyhow::{Context, Result};
use std::collections::HashMap;

use crate::storage::{Group, Value};

/// In-memory [`Group`] backed by hash maps.
#[derive(Debug, Clone, Default)]
pub struct HashMapGroup {
    values: HashMap<String, Value>,
    groups: HashMap<String, HashMapGroup>,
}

impl HashMapGroup {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(|k| k.as_str())
    }
}

impl Group for HashMapGroup {
    fn create_group(&mut self, name: &str) -> Result<&mut Self> {
        if self.values.contains_key(name) {
            anyhow::bail!("Cannot create group {}: a value has that name", name);
        }
        self.groups.insert(name.to_string(), HashMapGroup::default());
        self.groups
            .get_mut(name)
            .context("Group vanished after insertion")
    }

    fn group(&self, name: &str) -> Result<&Self> {
        self.groups
            .get(name)
            .with_context(|| format!("No group named {}", name))
    }

    fn write(&mut self, key: &str, value: Value) -> Result<()> {
        if self.groups.contains_key(key) {
            anyhow::bail!("Cannot write {}: a group has that name", key);
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn read(&self, key: &str) -> Result<&Value> {
        self.values
            .get(key)
            .with_context(|| format!("No value named {}", key))
    }

    fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key) | self.groups.contains_key(key)
    }
}

use super::Change;
use crate::core::{DbError, EntityState, Result, Value};
use std::collections::BTreeMap;

type EntityKey = (String, i64);

#[derive(Debug, Clone)]
struct TrackedEntry {
    state: EntityState,
    /// Value as last loaded or saved; `None` for added entities
    original: Option<Value>,
    current: Value,
    version: u64,
}

impl TrackedEntry {
    fn is_implicitly_modified(&self) -> bool {
        self.state == EntityState::Unchanged && self.original.as_ref() != Some(&self.current)
    }
}

/// Identity map of the entities a context knows about
#[derive(Debug, Default)]
pub(crate) struct ChangeTracker {
    entries: BTreeMap<EntityKey, TrackedEntry>,
}

impl ChangeTracker {
    pub fn is_tracked(&self, table: &str, id: i64) -> bool {
        self.entries.contains_key(&(table.to_string(), id))
    }

    pub fn current(&self, table: &str, id: i64) -> Option<(EntityState, Value)> {
        self.entries
            .get(&(table.to_string(), id))
            .map(|entry| (entry.state, entry.current.clone()))
    }

    pub fn track_added(&mut self, table: &str, id: i64, value: Value) -> Result<()> {
        self.ensure_untracked(table, id)?;
        self.entries.insert(
            (table.to_string(), id),
            TrackedEntry {
                state: EntityState::Added,
                original: None,
                current: value,
                version: 0,
            },
        );
        Ok(())
    }

    pub fn track_loaded(&mut self, table: &str, id: i64, value: Value, version: u64) -> Result<()> {
        self.ensure_untracked(table, id)?;
        self.entries.insert(
            (table.to_string(), id),
            TrackedEntry {
                state: EntityState::Unchanged,
                original: Some(value.clone()),
                current: value,
                version,
            },
        );
        Ok(())
    }

    /// Explicit update; returns the resulting state
    pub fn modify(&mut self, table: &str, id: i64, value: Value) -> Result<EntityState> {
        let entry = self.entry_mut(table, id)?;
        if entry.state == EntityState::Deleted {
            return Err(DbError::InvalidOperation(format!(
                "Entity {} in table '{}' is marked for deletion",
                id, table
            )));
        }

        entry.current = value;
        if entry.state != EntityState::Added {
            entry.state = EntityState::Modified;
        }
        Ok(entry.state)
    }

    /// Change a value without telling the tracker, as a mutated property would
    pub fn modify_untracked(&mut self, table: &str, id: i64, value: Value) -> Result<()> {
        self.entry_mut(table, id)?.current = value;
        Ok(())
    }

    /// Explicit removal; an added entity is simply forgotten
    pub fn remove(&mut self, table: &str, id: i64) -> Result<EntityState> {
        let entry = self.entry_mut(table, id)?;
        if entry.state == EntityState::Added {
            self.entries.remove(&(table.to_string(), id));
            return Ok(EntityState::Detached);
        }

        entry.state = EntityState::Deleted;
        Ok(EntityState::Deleted)
    }

    pub fn has_pending_changes(&self) -> bool {
        self.entries
            .values()
            .any(|entry| entry.state.is_pending() || entry.is_implicitly_modified())
    }

    /// Changes saving would write, in key order
    pub fn detect_changes(&self) -> Vec<Change> {
        self.entries
            .iter()
            .filter_map(|((table, id), entry)| {
                let table = table.clone();
                let id = *id;
                match entry.state {
                    EntityState::Added => Some(Change::Insert {
                        table,
                        id,
                        value: entry.current.clone(),
                    }),
                    EntityState::Modified => Some(Change::Update {
                        table,
                        id,
                        value: entry.current.clone(),
                        expected_version: Some(entry.version),
                    }),
                    EntityState::Unchanged if entry.is_implicitly_modified() => Some(Change::Update {
                        table,
                        id,
                        value: entry.current.clone(),
                        expected_version: Some(entry.version),
                    }),
                    EntityState::Deleted => Some(Change::Delete {
                        table,
                        id,
                        expected_version: Some(entry.version),
                    }),
                    EntityState::Unchanged | EntityState::Detached => None,
                }
            })
            .collect()
    }

    /// Mark every entity as saved
    pub fn accept_changes(&mut self) {
        self.entries
            .retain(|_, entry| entry.state != EntityState::Deleted);

        for entry in self.entries.values_mut() {
            match entry.state {
                EntityState::Added => entry.version = 1,
                EntityState::Modified => entry.version += 1,
                EntityState::Unchanged if entry.is_implicitly_modified() => entry.version += 1,
                _ => continue,
            }
            entry.state = EntityState::Unchanged;
            entry.original = Some(entry.current.clone());
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn ensure_untracked(&self, table: &str, id: i64) -> Result<()> {
        if self.is_tracked(table, id) {
            return Err(DbError::InvalidOperation(format!(
                "Another entity with key {} in table '{}' is already being tracked",
                id, table
            )));
        }
        Ok(())
    }

    fn entry_mut(&mut self, table: &str, id: i64) -> Result<&mut TrackedEntry> {
        self.entries.get_mut(&(table.to_string(), id)).ok_or_else(|| {
            DbError::InvalidOperation(format!(
                "Entity {} in table '{}' is not being tracked",
                id, table
            ))
        })
    }
}

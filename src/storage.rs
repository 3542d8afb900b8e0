//! Storage collaborator interface
//!
//! The server core does not persist anything itself; it calls into an
//! implementation of [`Storage`]. Failure is signaled on two channels, both
//! treated as failure by the dispatcher: an `Err` from the call, or an `Ok`
//! record whose id is the zero sentinel.
//!
//! [`MemoryStorage`] is a simple in-process implementation used by the demo
//! server and the tests; a real deployment would back this trait with a
//! database.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::errors::{ Error, Result };
use crate::protocol::Record;

/// The persistence component consumed by the dispatcher
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch the full record set
    async fn get_entries(&self) -> Result<Vec<Record>>;

    /// Insert a record; the returned record carries the assigned id
    async fn insert_entry(&self, description: &str, number: i64) -> Result<Record>;

    /// Update a record in place; the returned record reflects the new state
    async fn update_entry(&self, id: i64, description: &str, number: i64) -> Result<Record>;

    /// Delete a record; `Ok(false)` means nothing matched the id
    async fn delete_entry(&self, id: i64) -> Result<bool>;
}

struct MemoryInner {
    entries: Vec<Record>,
    next_id: i64,
}

/// In-memory [`Storage`] implementation
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    /// Create an empty store; ids are assigned from 1 upward
    pub fn new() -> Self {
        Self { inner: Mutex::new(MemoryInner { entries: Vec::new(), next_id: 1 }) }
    }

    /// Create a store pre-populated with the given records
    pub fn with_entries(entries: Vec<Record>) -> Self {
        let next_id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        Self { inner: Mutex::new(MemoryInner { entries, next_id }) }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_entries(&self) -> Result<Vec<Record>> {
        Ok(self.inner.lock().unwrap().entries.clone())
    }

    async fn insert_entry(&self, description: &str, number: i64) -> Result<Record> {
        let mut inner = self.inner.lock().unwrap();
        let record = Record { id: inner.next_id, description: description.to_string(), number };
        inner.next_id += 1;
        inner.entries.push(record.clone());
        Ok(record)
    }

    async fn update_entry(&self, id: i64, description: &str, number: i64) -> Result<Record> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.description = description.to_string();
                entry.number = number;
                Ok(entry.clone())
            }
            None => Err(Error::Storage(format!("no entry with id {}", id))),
        }
    }

    async fn delete_entry(&self, id: i64) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != id);
        Ok(inner.entries.len() != before)
    }
}

//! Process-wide status registry.
//!
//! Every long-lived component publishes a short human-readable status string
//! under its own key ("agent", "qan-log-parser", "qan-worker-3", ...). The
//! agent snapshots the registry to answer `Status` commands, so reads must
//! never block a component that is busy updating its own entry.
//!
//! The registry is read-mostly and follows a single-writer-per-key
//! discipline: each component overwrites only the keys it owns.

use std::sync::Mutex;

use dashmap::DashMap;

/// Concurrent mapping from component name to a short status string.
///
/// Keys registered at construction keep their insertion order in
/// [`snapshot`](StatusRegistry::snapshot); keys created later by `update`
/// are appended in first-write order.
pub struct StatusRegistry {
    entries: DashMap<String, String>,
    order: Mutex<Vec<String>>,
}

impl StatusRegistry {
    /// Creates a registry with the given keys pre-registered (empty values).
    pub fn new(names: &[&str]) -> Self {
        let entries = DashMap::new();
        let mut order = Vec::with_capacity(names.len());
        for name in names {
            entries.insert(name.to_string(), String::new());
            order.push(name.to_string());
        }
        Self {
            entries,
            order: Mutex::new(order),
        }
    }

    /// Sets the status string for `name`, registering the key if new.
    pub fn update(&self, name: &str, value: impl Into<String>) {
        if self.entries.insert(name.to_string(), value.into()).is_none() {
            if let Ok(mut order) = self.order.lock() {
                order.push(name.to_string());
            }
        }
    }

    /// Sets a uniform "verb id" status for a command being handled.
    pub fn update_cmd(&self, name: &str, verb: &str, cmd_id: u64) {
        self.update(name, format!("{} {}", verb, cmd_id));
    }

    /// Returns the current status for `name`, or an empty string if the key
    /// was never registered.
    pub fn get(&self, name: &str) -> String {
        self.entries
            .get(name)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    /// Removes a key entirely (used when a transient component goes away).
    pub fn remove(&self, name: &str) {
        self.entries.remove(name);
        if let Ok(mut order) = self.order.lock() {
            order.retain(|n| n != name);
        }
    }

    /// Returns an insertion-ordered copy of all entries.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let order = match self.order.lock() {
            Ok(order) => order.clone(),
            Err(_) => return Vec::new(),
        };
        order
            .into_iter()
            .filter_map(|name| {
                let value = self.entries.get(&name)?.value().clone();
                Some((name, value))
            })
            .collect()
    }
}

//! The per-visor routing table.
//!
//! Maps route ids to rules with atomic id reservation and activity-driven
//! expiry. The table is the source of truth for dispatch; route groups only
//! hold copies of their rules.
//!
//! Uses `DashMap` for lock-free concurrent access on the packet hot path;
//! id reservation takes a separate mutex so a batch of ids is handed out
//! atomically.

use crate::error::RoutingError;
use crate::rule::{Rule, RULE_HEADER_SIZE};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Identifier of a rule within one visor's table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RouteId(pub u32);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct RuleEntry {
    rule: Rule,
    last_activity: Instant,
}

impl RuleEntry {
    fn expired(&self, now: Instant) -> bool {
        let keep_alive = self.rule.keep_alive();
        !keep_alive.is_zero() && now.duration_since(self.last_activity) > keep_alive
    }
}

/// Mapping of route id → rule with reservation, expiry and snapshots.
pub struct RoutingTable {
    rules: DashMap<RouteId, RuleEntry>,
    next_id: Mutex<u32>,
}

impl RoutingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            next_id: Mutex::new(0),
        }
    }

    /// Atomically reserve `n` unused route ids.
    ///
    /// Reserved ids are never handed out twice, even if the rule saved
    /// under them is later deleted.
    ///
    /// # Errors
    ///
    /// `Exhausted` once the id space can no longer fit `n` more ids.
    pub fn reserve_keys(&self, n: usize) -> Result<Vec<RouteId>, RoutingError> {
        let mut next = self
            .next_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let n32 = u32::try_from(n).map_err(|_| RoutingError::Exhausted)?;
        if u32::MAX - *next < n32 {
            return Err(RoutingError::Exhausted);
        }
        let ids = (1..=n32).map(|i| RouteId(*next + i)).collect();
        *next += n32;
        Ok(ids)
    }

    /// Upsert a rule under its key route id, resetting its activity.
    pub fn save_rule(&self, rule: Rule) {
        let id = rule.key_route_id();
        tracing::debug!(%id, %rule, "saving rule");
        self.rules.insert(
            id,
            RuleEntry {
                rule,
                last_activity: Instant::now(),
            },
        );
    }

    /// Fetch the rule stored under `id`.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent or already past its keep-alive.
    pub fn rule(&self, id: RouteId) -> Result<Rule, RoutingError> {
        match self.rules.get(&id) {
            Some(entry) if !entry.expired(Instant::now()) => Ok(entry.rule.clone()),
            _ => Err(RoutingError::NotFound(id)),
        }
    }

    /// Remove the rules stored under `ids`.
    pub fn del_rules(&self, ids: &[RouteId]) {
        for id in ids {
            if self.rules.remove(id).is_some() {
                tracing::debug!(%id, "deleted rule");
            }
        }
    }

    /// Snapshot of every live rule.
    #[must_use]
    pub fn all_rules(&self) -> Vec<Rule> {
        self.rules.iter().map(|e| e.rule.clone()).collect()
    }

    /// Number of stored rules.
    #[must_use]
    pub fn count(&self) -> usize {
        self.rules.len()
    }

    /// Record that a packet matched the rule under `id` at time now.
    ///
    /// Non-blocking on the packet hot path; a missing id is ignored.
    pub fn update_activity(&self, id: RouteId) {
        if let Some(mut entry) = self.rules.get_mut(&id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Remove and return every rule whose inactivity exceeds its
    /// keep-alive.
    ///
    /// Driven by the router once per second; the router closes route
    /// groups holding returned endpoint rules.
    pub fn sweep(&self) -> Vec<Rule> {
        let now = Instant::now();
        let expired: Vec<RouteId> = self
            .rules
            .iter()
            .filter(|e| e.expired(now))
            .map(|e| *e.key())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some((_, entry)) = self.rules.remove(&id) {
                tracing::debug!(%id, "rule expired");
                removed.push(entry.rule);
            }
        }
        removed
    }

    /// Serialize the table for persistence.
    ///
    /// # Errors
    ///
    /// Propagates encoder failures.
    pub fn snapshot(&self) -> Result<Vec<u8>, bincode::Error> {
        let entries: Vec<(u32, Vec<u8>)> = self
            .rules
            .iter()
            .map(|e| (e.key().0, e.rule.as_bytes().to_vec()))
            .collect();
        bincode::serialize(&entries)
    }

    /// Load a persisted table, discarding rules shorter than the header
    /// or otherwise unparseable.
    ///
    /// # Errors
    ///
    /// Propagates decoder failures on the outer container only.
    pub fn load(raw: &[u8]) -> Result<Self, bincode::Error> {
        let entries: Vec<(u32, Vec<u8>)> = bincode::deserialize(raw)?;
        let table = Self::new();
        let mut top = 0u32;
        for (id, bytes) in entries {
            if bytes.len() < RULE_HEADER_SIZE {
                tracing::warn!(id, len = bytes.len(), "discarding short persisted rule");
                continue;
            }
            match Rule::from_bytes(bytes) {
                Ok(rule) => {
                    top = top.max(id);
                    table.save_rule(rule);
                }
                Err(err) => {
                    tracing::warn!(id, %err, "discarding unparseable persisted rule");
                }
            }
        }
        *table
            .next_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = top;
        Ok(table)
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::RouteDescriptor;
    use skein_crypto::Keypair;

    fn consume_rule(keep_alive: Duration, id: RouteId) -> Rule {
        let desc = RouteDescriptor::new(
            Keypair::generate().public,
            Keypair::generate().public,
            1,
            2,
        );
        Rule::consume(keep_alive, id, desc)
    }

    #[test]
    fn test_reserve_is_contiguous_and_unique() {
        let table = RoutingTable::new();
        let first = table.reserve_keys(3).unwrap();
        let second = table.reserve_keys(2).unwrap();
        assert_eq!(first, vec![RouteId(1), RouteId(2), RouteId(3)]);
        assert_eq!(second, vec![RouteId(4), RouteId(5)]);
    }

    #[test]
    fn test_reserve_exhaustion() {
        let table = RoutingTable::new();
        *table.next_id.lock().unwrap() = u32::MAX - 1;
        assert_eq!(table.reserve_keys(1).unwrap().len(), 1);
        assert_eq!(table.reserve_keys(1).unwrap_err(), RoutingError::Exhausted);
    }

    #[test]
    fn test_save_get_delete() {
        let table = RoutingTable::new();
        let rule = consume_rule(Duration::from_secs(60), RouteId(1));
        table.save_rule(rule.clone());
        assert_eq!(table.rule(RouteId(1)).unwrap(), rule);
        assert_eq!(table.count(), 1);

        table.del_rules(&[RouteId(1)]);
        assert_eq!(
            table.rule(RouteId(1)).unwrap_err(),
            RoutingError::NotFound(RouteId(1))
        );
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_expired_rule_not_returned() {
        let table = RoutingTable::new();
        table.save_rule(consume_rule(Duration::from_millis(1), RouteId(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(table.rule(RouteId(1)).is_err());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let table = RoutingTable::new();
        table.save_rule(consume_rule(Duration::from_millis(1), RouteId(1)));
        table.save_rule(consume_rule(Duration::from_secs(60), RouteId(2)));
        std::thread::sleep(Duration::from_millis(20));

        let removed = table.sweep();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key_route_id(), RouteId(1));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_update_activity_defers_expiry() {
        let table = RoutingTable::new();
        table.save_rule(consume_rule(Duration::from_millis(50), RouteId(1)));
        std::thread::sleep(Duration::from_millis(30));
        table.update_activity(RouteId(1));
        std::thread::sleep(Duration::from_millis(30));
        assert!(table.rule(RouteId(1)).is_ok());
        assert!(table.sweep().is_empty());
    }

    #[test]
    fn test_zero_keep_alive_never_expires() {
        let table = RoutingTable::new();
        table.save_rule(consume_rule(Duration::ZERO, RouteId(1)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(table.sweep().is_empty());
        assert!(table.rule(RouteId(1)).is_ok());
    }

    #[test]
    fn test_snapshot_load_discards_garbage() {
        let table = RoutingTable::new();
        table.save_rule(consume_rule(Duration::from_secs(60), RouteId(7)));
        let mut entries: Vec<(u32, Vec<u8>)> =
            bincode::deserialize(&table.snapshot().unwrap()).unwrap();
        entries.push((8, vec![0u8; RULE_HEADER_SIZE - 2]));
        let raw = bincode::serialize(&entries).unwrap();

        let loaded = RoutingTable::load(&raw).unwrap();
        assert_eq!(loaded.count(), 1);
        assert!(loaded.rule(RouteId(7)).is_ok());
        // reserved ids continue past the loaded maximum
        assert_eq!(loaded.reserve_keys(1).unwrap(), vec![RouteId(8)]);
    }
}

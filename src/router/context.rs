// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-pass routing state.
//!
//! One [`RouterContext`] lives for one channel pass. Routers use its keyed
//! cache to leave signals for later rows and for their post-commit hook
//! (e.g. "channel config changed, flush the metadata cache").

use crate::config::ChannelConfig;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// A value in the context cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    Flag,
    Set(BTreeSet<String>),
}

/// Running counters of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingStats {
    pub rows_read: u64,
    pub data_events: u64,
    /// Rows recorded against the unrouted node.
    pub rows_unrouted: u64,
    pub batches_closed: u64,
    pub router_time: Duration,
}

#[derive(Debug, Clone)]
pub struct RouterContext {
    channel: ChannelConfig,
    cache: HashMap<String, ContextValue>,
    at_transaction_boundary: bool,
    last_transaction_id: Option<String>,
    stats: RoutingStats,
}

impl RouterContext {
    pub fn new(channel: ChannelConfig) -> Self {
        Self {
            channel,
            cache: HashMap::new(),
            at_transaction_boundary: true,
            last_transaction_id: None,
            stats: RoutingStats::default(),
        }
    }

    pub fn channel(&self) -> &ChannelConfig {
        &self.channel
    }

    /// Record the row being routed and whether the row after it starts a
    /// new transaction.
    pub fn advance(&mut self, transaction_id: Option<&str>, next_transaction_id: Option<Option<&str>>) {
        self.last_transaction_id = transaction_id.map(str::to_string);
        self.at_transaction_boundary = match (transaction_id, next_transaction_id) {
            // End of stream
            (_, None) => true,
            (Some(current), Some(Some(next))) => current != next,
            _ => true,
        };
    }

    pub fn at_transaction_boundary(&self) -> bool {
        self.at_transaction_boundary
    }

    pub fn last_transaction_id(&self) -> Option<&str> {
        self.last_transaction_id.as_deref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Signal cache
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_flag(&mut self, key: &str) {
        self.cache.insert(key.to_string(), ContextValue::Flag);
    }

    pub fn has(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Add `value` to the set under `key`. A flag under the same key is
    /// replaced by the set.
    pub fn add_to_set(&mut self, key: &str, value: &str) {
        match self.cache.get_mut(key) {
            Some(ContextValue::Set(set)) => {
                set.insert(value.to_string());
            }
            _ => {
                self.cache.insert(
                    key.to_string(),
                    ContextValue::Set(BTreeSet::from([value.to_string()])),
                );
            }
        }
    }

    pub fn set(&self, key: &str) -> Option<&BTreeSet<String>> {
        match self.cache.get(key) {
            Some(ContextValue::Set(set)) => Some(set),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<ContextValue> {
        self.cache.remove(key)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stats
    // ─────────────────────────────────────────────────────────────────────────

    pub fn stats(&self) -> &RoutingStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut RoutingStats {
        &mut self.stats
    }
}

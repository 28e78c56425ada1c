// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Bookkeeping of creates and deletes a controller has issued but not yet
//! seen come back through its watch.
//!
//! A Node-Set reconcile that just created three nodes must not create three
//! more because the informer has not delivered them yet. The reconciler
//! records what it expects, the watch side marks observations, and the next
//! pass only mutates once everything is accounted for. Records older than the
//! timeout count as satisfied, so a lost event costs one redundant pass, never
//! a stalled controller.

use dashmap::DashMap;
use log::debug;
use std::collections::HashSet;
use std::time::{Duration, Instant};

pub const EXPECTATIONS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct Expectation {
    add: i64,
    del: HashSet<String>,
    timestamp: Instant,
}

impl Expectation {
    fn new() -> Self {
        Self {
            add: 0,
            del: HashSet::new(),
            timestamp: Instant::now(),
        }
    }

    fn fulfilled(&self) -> bool {
        self.add <= 0 && self.del.is_empty()
    }
}

/// Shared between reconcilers and the watch observer. Each key is guarded by
/// its own map shard lock.
#[derive(Debug)]
pub struct Expectations {
    records: DashMap<String, Expectation>,
    timeout: Duration,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::with_timeout(EXPECTATIONS_TIMEOUT)
    }
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            records: DashMap::new(),
            timeout,
        }
    }

    pub fn expect_creations(&self, key: &str, adds: usize) {
        let mut record = self.records.entry(key.to_string()).or_insert_with(Expectation::new);
        record.add = adds as i64;
        record.timestamp = Instant::now();
        debug!("expecting {adds} creations for {key}");
    }

    pub fn expect_deletions(&self, key: &str, child_keys: impl IntoIterator<Item = String>) {
        let mut record = self.records.entry(key.to_string()).or_insert_with(Expectation::new);
        record.del = child_keys.into_iter().collect();
        record.timestamp = Instant::now();
        debug!("expecting {} deletions for {key}", record.del.len());
    }

    pub fn creation_observed(&self, key: &str) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.add -= 1;
        }
    }

    pub fn deletion_observed(&self, key: &str, child_key: &str) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.del.remove(child_key);
        }
    }

    pub fn satisfied(&self, key: &str) -> bool {
        match self.records.get(key) {
            Some(record) if record.fulfilled() => true,
            Some(record) if record.timestamp.elapsed() > self.timeout => {
                debug!("expectations for {key} expired");
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    pub fn delete_expectations(&self, key: &str) {
        self.records.remove(key);
    }

    /// Pending (creations, deletions) for `key`, if a record exists.
    pub fn pending(&self, key: &str) -> Option<(i64, usize)> {
        self.records.get(key).map(|r| (r.add, r.del.len()))
    }
}

// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Order in which surplus nodes are removed on scale down.

use chrono::{DateTime, Utc};
use kube::Resource;
use std::cmp::Ordering;
use std::collections::HashMap;

use crds::EtcdNode;
use crds::conditions::{READY_CONDITION, find_condition};

struct Rank<'a> {
    node: &'a EtcdNode,
    host: Option<&'a str>,
    ready: bool,
    ready_since: Option<DateTime<Utc>>,
    created: Option<DateTime<Utc>>,
    colocated: usize,
}

fn host(node: &EtcdNode) -> Option<&str> {
    node.status
        .as_ref()?
        .host
        .as_deref()
        .filter(|h| !h.is_empty())
}

fn ready_condition(node: &EtcdNode) -> Option<(bool, Option<DateTime<Utc>>)> {
    let conditions = &node.status.as_ref()?.conditions;
    let ready = find_condition(conditions, READY_CONDITION)?;
    Some((ready.is_true(), ready.last_transition_time.as_ref().map(|t| t.0)))
}

/// log2 of the nanoseconds elapsed since `t`. Timestamps in the same bucket
/// are considered equally old; unknown or future ones are the youngest.
fn age_bucket(t: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    let Some(t) = t else {
        return -1;
    };
    match (now - t).num_nanoseconds() {
        Some(d) if d > 0 => (d as f64).log2() as i64,
        Some(_) => -1,
        None => i64::MAX,
    }
}

fn compare(a: &Rank, b: &Rank, now: DateTime<Utc>) -> Ordering {
    a.host
        .is_some()
        .cmp(&b.host.is_some())
        .then(a.ready.cmp(&b.ready))
        .then(b.colocated.cmp(&a.colocated))
        .then_with(|| match a.ready && b.ready {
            true => age_bucket(b.ready_since, now).cmp(&age_bucket(a.ready_since, now)),
            false => Ordering::Equal,
        })
        .then_with(|| age_bucket(a.created, now).cmp(&age_bucket(b.created, now)))
        .then_with(|| a.node.meta().uid.cmp(&b.node.meta().uid))
}

/// Sorts `nodes` so that the ones to delete first come first:
/// unscheduled before scheduled, not ready before ready, crowded hosts before
/// sparse ones, long ready before recently ready, young before old, then by
/// uid.
pub fn rank_for_deletion<'a>(nodes: &[&'a EtcdNode], now: DateTime<Utc>) -> Vec<&'a EtcdNode> {
    let mut ready_on_host: HashMap<&str, usize> = HashMap::new();
    let mut ranks: Vec<Rank<'a>> = nodes
        .iter()
        .map(|&node| {
            let (ready, ready_since) = ready_condition(node).unwrap_or((false, None));
            let host = host(node);
            if let (Some(h), true) = (host, ready) {
                *ready_on_host.entry(h).or_default() += 1;
            }
            Rank {
                node,
                host,
                ready,
                ready_since,
                created: node.meta().creation_timestamp.as_ref().map(|t| t.0),
                colocated: 0,
            }
        })
        .collect();
    for rank in &mut ranks {
        rank.colocated = rank
            .host
            .and_then(|h| ready_on_host.get(h).copied())
            .unwrap_or_default();
    }
    ranks.sort_by(|a, b| compare(a, b, now));
    ranks.into_iter().map(|r| r.node).collect()
}

// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use chrono::{SubsecRound, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY_CONDITION: &str = "Ready";
pub const PROVISIONED_CONDITION: &str = "Provisioned";
pub const MEMBER_FINALIZED_CONDITION: &str = "MemberFinalized";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl StatusCondition {
    pub fn is_true(&self) -> bool {
        self.status == condition_status(true)
    }
}

pub fn condition_status(status: bool) -> String {
    match status {
        true => "True".to_string(),
        false => "False".to_string(),
    }
}

/// Current time at the resolution the API server stores, so that a status
/// written and read back compares equal.
pub fn now() -> Time {
    Time(Utc::now().trunc_subsecs(0))
}

pub fn find_condition<'a>(
    conditions: &'a [StatusCondition],
    type_: &str,
) -> Option<&'a StatusCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[StatusCondition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(StatusCondition::is_true)
}

/// Records a condition, keeping at most one entry per type.
///
/// `last_transition_time` moves only when the status flips. `last_probe_time`
/// moves only when `probed` is set and the observed status is true.
pub fn set_condition(
    conditions: &mut Vec<StatusCondition>,
    type_: &str,
    status: bool,
    message: &str,
    probed: bool,
    now: Time,
) {
    let status_str = condition_status(status);
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status_str {
                existing.status = status_str;
                existing.last_transition_time = Some(now.clone());
            }
            if probed && status {
                existing.last_probe_time = Some(now);
            }
            existing.message = message.to_string();
        }
        None => conditions.push(StatusCondition {
            type_: type_.to_string(),
            status: status_str,
            last_probe_time: (probed && status).then(|| now.clone()),
            last_transition_time: Some(now),
            message: message.to_string(),
        }),
    }
}

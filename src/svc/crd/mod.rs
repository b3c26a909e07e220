//! # Custom resource definition module
//!
//! This module provide custom resource definition managed by the operator,
//! their structures, implementation and reconciliation loop.

use std::fmt::{self, Display, Formatter};

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod binding_map;
pub mod ip_allocation;
pub mod network_config;
pub mod network_info;
pub mod security_policy;
pub mod subnet;
pub mod subnet_port;
pub mod subnet_set;

// -----------------------------------------------------------------------------
// Constants

pub const GROUP: &str = "vpc.nsx.vmware.com";
pub const VERSION: &str = "v1alpha1";

pub const ANNOTATION_NETWORK_CONFIG: &str = "nsx.vmware.com/vpc_network_config";
pub const ANNOTATION_DEFAULT_NETWORK_CONFIG: &str = "nsx.vmware.com/default-network-config";
pub const ANNOTATION_ASSOCIATED_RESOURCE: &str = "nsx.vmware.com/associated-resource";
pub const ANNOTATION_SHARED_VPC_NAMESPACE: &str = "nsx.vmware.com/shared_vpc_namespace";
pub const ANNOTATION_VPC_ERROR: &str = "nsx.vmware.com/vpc_error";
pub const ANNOTATION_SYSTEM: &str = "nsx.vmware.com/system";

pub const CONDITION_READY: &str = "Ready";

// -----------------------------------------------------------------------------
// AccessMode enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum AccessMode {
    /// reachable from outside the vpc
    Public,
    /// reachable from the vpc only
    #[default]
    Private,
    /// reachable from every vpc of the project
    Project,
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Public => write!(f, "Public"),
            Self::Private => write!(f, "Private"),
            Self::Project => write!(f, "Project"),
        }
    }
}

// -----------------------------------------------------------------------------
// HasConditions trait

/// resources carrying a `Ready` condition in their status
pub trait HasConditions {
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn conditions(&self) -> &[Condition];

    fn is_ready(&self) -> bool {
        self.conditions()
            .iter()
            .any(|condition| condition.type_ == CONDITION_READY && condition.status == "True")
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// build a `Ready` condition with the given outcome
pub fn ready_condition(status: bool, reason: &str, message: &str) -> Condition {
    Condition {
        type_: CONDITION_READY.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

/// merge the condition into the list, the transition time is updated only if
/// the status actually changes
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        None => {
            conditions.push(condition);
            true
        }
        Some(existing) => {
            let changed = existing.status != condition.status
                || existing.reason != condition.reason
                || existing.message != condition.message;

            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.to_owned();
            }

            *existing = condition;
            changed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_should_preserve_transition_time_on_same_status() {
        let mut conditions = vec![];
        upsert_condition(&mut conditions, ready_condition(true, "Realized", "ok"));
        let first = conditions[0].last_transition_time.to_owned();

        std::thread::sleep(std::time::Duration::from_millis(2));
        let changed = upsert_condition(&mut conditions, ready_condition(true, "Realized", "ok"));

        assert!(!changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
    }

    #[test]
    fn upsert_should_update_transition_time_on_flip() {
        let mut conditions = vec![];
        upsert_condition(&mut conditions, ready_condition(true, "Realized", "ok"));
        let first = conditions[0].last_transition_time.to_owned();

        std::thread::sleep(std::time::Duration::from_millis(2));
        let changed = upsert_condition(
            &mut conditions,
            ready_condition(false, "ApplyFailed", "boom"),
        );

        assert!(changed);
        assert_eq!(conditions[0].status, "False");
        assert_ne!(conditions[0].last_transition_time, first);
    }
}

//! # NetworkInfo custom resource
//!
//! This module provide the network info custom resource holding the realized
//! vpc state of a namespace, it is created by the operator only

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::svc::crd::HasConditions;

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "vpc.nsx.vmware.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "NetworkInfo")]
#[kube(singular = "networkinfo")]
#[kube(plural = "networkinfos")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct Spec {}

// -----------------------------------------------------------------------------
// Status structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct VpcState {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "vpcPath")]
    pub vpc_path: String,
    #[serde(rename = "privateIPs", default, skip_serializing_if = "Vec::is_empty")]
    pub private_ips: Vec<String>,
    #[serde(rename = "defaultSNATIP", default, skip_serializing_if = "Option::is_none")]
    pub default_snat_ip: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "vpcs", default, skip_serializing_if = "Vec::is_empty")]
    pub vpcs: Vec<VpcState>,
    #[serde(rename = "conditions", default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for NetworkInfo {
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Status::default).conditions
    }

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// network info resource for the given namespace, named after it
pub fn for_namespace(namespace: &str) -> NetworkInfo {
    let mut info = NetworkInfo::new(namespace, Spec {});
    info.metadata.namespace = Some(namespace.to_string());
    info
}

#[cfg(test)]
mod tests {
    use kube::ResourceExt;

    use super::*;

    #[test]
    fn for_namespace_should_name_the_resource_after_the_namespace() {
        let info = for_namespace("ns-a");

        assert_eq!(info.name_any(), "ns-a");
        assert_eq!(info.namespace().as_deref(), Some("ns-a"));
    }
}

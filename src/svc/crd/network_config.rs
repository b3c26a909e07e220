//! # VPCNetworkConfiguration custom resource
//!
//! This module provide the cluster-scoped network configuration custom
//! resource namespaces draw their vpc settings from

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{api::ListParams, Api, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::svc::{
    crd::{AccessMode, HasConditions, ANNOTATION_DEFAULT_NETWORK_CONFIG},
    k8s::{status, Classify, Kind, Outcome, Reconcile, State},
    nsx::{
        self,
        path::{AssociatedKey, ResourcePath},
    },
};

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "vpc.nsx.vmware.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "VPCNetworkConfiguration")]
#[kube(singular = "vpcnetworkconfiguration")]
#[kube(plural = "vpcnetworkconfigurations")]
#[kube(status = "Status")]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct Spec {
    /// fabric project the vpcs of bound namespaces are created under
    #[serde(rename = "nsxProject")]
    pub nsx_project: String,
    /// pre-created vpc path, bound namespaces share it instead of getting
    /// their own
    #[serde(rename = "vpc", default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<String>,
    #[serde(rename = "privateIPs", default, skip_serializing_if = "Vec::is_empty")]
    pub private_ips: Vec<String>,
    #[serde(rename = "defaultSubnetSize", default, skip_serializing_if = "Option::is_none")]
    pub default_subnet_size: Option<u32>,
    #[serde(rename = "podAccessMode", default, skip_serializing_if = "Option::is_none")]
    pub pod_access_mode: Option<AccessMode>,
    /// fabric subnets imported by reference into every bound namespace
    #[serde(rename = "sharedSubnets", default, skip_serializing_if = "Vec::is_empty")]
    pub shared_subnets: Vec<String>,
}

// -----------------------------------------------------------------------------
// Status structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct VpcInfo {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "vpcPath")]
    pub vpc_path: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "vpcs", default, skip_serializing_if = "Vec::is_empty")]
    pub vpcs: Vec<VpcInfo>,
    #[serde(rename = "conditions", default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for VPCNetworkConfiguration {
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
// VPCNetworkConfiguration implementation

impl VPCNetworkConfiguration {
    /// returns if this configuration carries the default marker
    pub fn is_default(&self) -> bool {
        self.annotations()
            .get(ANNOTATION_DEFAULT_NETWORK_CONFIG)
            .is_some_and(|value| value == "true")
    }

    /// parsed shared subnet paths with their associated-resource keys
    pub fn shared_subnet_keys(&self) -> Result<Vec<(AssociatedKey, ResourcePath)>, nsx::path::Error> {
        self.spec
            .shared_subnets
            .iter()
            .map(|path| {
                let parsed: ResourcePath = path.parse()?;
                Ok((AssociatedKey::from(&parsed), parsed))
            })
            .collect()
    }
}

/// returns the unique configuration carrying the default marker
pub async fn find_default(
    kube: kube::Client,
) -> Result<Option<VPCNetworkConfiguration>, kube::Error> {
    let api: Api<VPCNetworkConfiguration> = Api::all(kube);
    let mut defaults: Vec<VPCNetworkConfiguration> = api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(VPCNetworkConfiguration::is_default)
        .collect();

    defaults.sort_by_key(ResourceExt::name_any);
    Ok(defaults.into_iter().next())
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to execute request on the fabric, {0}")]
    Fabric(nsx::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<nsx::Error> for ReconcilerError {
    fn from(err: nsx::Error) -> Self {
        Self::Fabric(err)
    }
}

impl Classify for ReconcilerError {
    fn kind(&self) -> Kind {
        match self {
            Self::KubeClient(err) => err.kind(),
            Self::Fabric(err) => Classify::kind(err),
        }
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

#[async_trait]
impl Reconcile for Reconciler {
    type Resource = VPCNetworkConfiguration;
    type Error = ReconcilerError;

    const KIND: &'static str = "VPCNetworkConfiguration";
    const FINALIZER: Option<&'static str> = None;

    fn api(state: &State, _namespace: Option<&str>) -> Api<VPCNetworkConfiguration> {
        Api::all(state.kube.to_owned())
    }

    fn validate(&self, obj: &VPCNetworkConfiguration) -> Result<(), String> {
        if obj.spec.nsx_project.is_empty() {
            return Err("nsxProject must not be empty".to_string());
        }

        if let Some(vpc) = &obj.spec.vpc {
            if vpc.parse::<nsx::path::VpcPath>().is_err() {
                return Err(format!("vpc '{vpc}' is not a valid vpc path"));
            }
        }

        if let Err(err) = obj.shared_subnet_keys() {
            return Err(format!("invalid shared subnet path, {err}"));
        }

        Ok(())
    }

    async fn rejected(&self, state: &Arc<State>, obj: Arc<VPCNetworkConfiguration>, message: &str) {
        let api = Self::api(state, None);
        let _ = status::update_fail(
            state,
            &api,
            Self::KIND,
            obj.as_ref(),
            status::REASON_VALIDATION_FAILED,
            message,
        )
        .await;
    }

    async fn apply(
        &self,
        state: &Arc<State>,
        obj: Arc<VPCNetworkConfiguration>,
    ) -> Result<Outcome, ReconcilerError> {
        let api = Self::api(state, None);
        let name = obj.name_any();

        // ---------------------------------------------------------------------
        // Step 1: exactly one configuration may carry the default marker

        if obj.is_default() {
            let other: Vec<String> = api
                .list(&ListParams::default())
                .await?
                .items
                .iter()
                .filter(|candidate| candidate.is_default() && candidate.name_any() != name)
                .map(ResourceExt::name_any)
                .collect();

            if !other.is_empty() {
                status::update_fail(
                    state,
                    &api,
                    Self::KIND,
                    obj.as_ref(),
                    status::REASON_VALIDATION_FAILED,
                    &format!(
                        "multiple configurations carry the default marker: {}",
                        other.join(", ")
                    ),
                )
                .await?;

                // terminal until one of the markers goes away
                return Ok(Outcome::Done);
            }
        }

        // ---------------------------------------------------------------------
        // Step 2: nothing to realize eagerly, bound namespaces fan out from
        // the watch source and consume the configuration themselves

        status::update_success(
            state,
            &api,
            Self::KIND,
            obj.as_ref(),
            &format!("Network configuration '{name}' accepted"),
        )
        .await?;

        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(project: &str, shared: Vec<&str>) -> VPCNetworkConfiguration {
        VPCNetworkConfiguration::new(
            "nc-1",
            Spec {
                nsx_project: project.to_string(),
                shared_subnets: shared.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn validate_should_reject_malformed_shared_subnets() {
        let reconciler = Reconciler::default();

        assert!(reconciler
            .validate(&config("/orgs/default/projects/p", vec![]))
            .is_ok());
        assert!(reconciler
            .validate(&config(
                "/orgs/default/projects/p",
                vec!["/orgs/default/projects/p/vpcs/v/subnets/s"],
            ))
            .is_ok());
        assert!(reconciler
            .validate(&config("/orgs/default/projects/p", vec!["not-a-path"]))
            .is_err());
        assert!(reconciler.validate(&config("", vec![])).is_err());
    }

    #[test]
    fn default_marker_should_require_the_documented_value() {
        let mut obj = config("/orgs/default/projects/p", vec![]);
        assert!(!obj.is_default());

        obj.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_DEFAULT_NETWORK_CONFIG.to_string(), "true".to_string());
        assert!(obj.is_default());

        obj.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_DEFAULT_NETWORK_CONFIG.to_string(), "false".to_string());
        assert!(!obj.is_default());
    }

    #[test]
    fn shared_subnet_keys_should_expose_associated_keys() {
        let obj = config(
            "/orgs/default/projects/p",
            vec![
                "/orgs/default/projects/p/vpcs/v/subnets/s1",
                "/orgs/default/projects/p/vpcs/v/subnets/s2",
            ],
        );

        let keys = obj.shared_subnet_keys().expect("keys to parse");

        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].0.to_string(), "p:v:s1");
        assert_eq!(keys[1].0.to_string(), "p:v:s2");
    }
}

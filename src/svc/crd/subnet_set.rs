//! # SubnetSet custom resource
//!
//! This module provide the subnet set custom resource, a declarative pool
//! from which individual subnets are drawn on demand

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::Condition};
use kube::{api::ListParams, Api, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::svc::{
    crd::{AccessMode, HasConditions},
    k8s::{
        controller::{fingerprint, Mapper},
        resource, status, Classify, Kind, Outcome, Reconcile, Request, State,
    },
    nsx,
};

// -----------------------------------------------------------------------------
// Constants

pub const SUBNET_SET_FINALIZER: &str = "nsx.vmware.com/subnetset";
pub const CREATED_FOR: &str = "subnetset";

pub const DEFAULT_VM_SUBNET_SET: &str = "default-vm-subnetset";
pub const DEFAULT_POD_SUBNET_SET: &str = "default-pod-subnetset";

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "vpc.nsx.vmware.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "SubnetSet")]
#[kube(singular = "subnetset")]
#[kube(plural = "subnetsets")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct Spec {
    #[serde(rename = "accessMode", default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,
    #[serde(rename = "ipv4SubnetSize", default, skip_serializing_if = "Option::is_none")]
    pub ipv4_subnet_size: Option<u32>,
}

// -----------------------------------------------------------------------------
// Status structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct SubnetInfo {
    #[serde(rename = "nsxPath")]
    pub nsx_path: String,
    #[serde(rename = "networkAddresses", default, skip_serializing_if = "Vec::is_empty")]
    pub network_addresses: Vec<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "subnets", default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetInfo>,
    #[serde(rename = "conditions", default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for SubnetSet {
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

/// the default subnet set virtual machines draw from, private access
pub fn default_vm(size: u32) -> SubnetSet {
    SubnetSet::new(
        DEFAULT_VM_SUBNET_SET,
        Spec {
            access_mode: Some(AccessMode::Private),
            ipv4_subnet_size: Some(size),
        },
    )
}

/// the default subnet set pods draw from, project access
pub fn default_pod(size: u32) -> SubnetSet {
    SubnetSet::new(
        DEFAULT_POD_SUBNET_SET,
        Spec {
            access_mode: Some(AccessMode::Project),
            ipv4_subnet_size: Some(size),
        },
    )
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to execute request on the fabric, {0}")]
    Fabric(nsx::Error),
    #[error("subnet set is still targeted by binding map '{0}'")]
    Referenced(String),
    #[error("the vpc for namespace '{0}' is not realized yet")]
    VpcUnready(String),
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
            Self::Referenced(_) => Kind::Referenced,
            Self::VpcUnready(_) => Kind::DependencyUnready,
        }
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

#[async_trait]
impl Reconcile for Reconciler {
    type Resource = SubnetSet;
    type Error = ReconcilerError;

    const KIND: &'static str = "SubnetSet";
    const FINALIZER: Option<&'static str> = Some(SUBNET_SET_FINALIZER);

    fn api(state: &State, namespace: Option<&str>) -> Api<SubnetSet> {
        match namespace {
            Some(namespace) => Api::namespaced(state.kube.to_owned(), namespace),
            None => Api::all(state.kube.to_owned()),
        }
    }

    fn validate(&self, obj: &SubnetSet) -> Result<(), String> {
        if let Some(size) = obj.spec.ipv4_subnet_size {
            if size < 16 || !size.is_power_of_two() {
                return Err(format!(
                    "ipv4SubnetSize must be a power of two of at least 16, got {size}"
                ));
            }
        }

        Ok(())
    }

    async fn rejected(&self, state: &Arc<State>, obj: Arc<SubnetSet>, message: &str) {
        let api = Self::api(state, obj.namespace().as_deref());
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

    async fn apply(&self, state: &Arc<State>, obj: Arc<SubnetSet>) -> Result<Outcome, ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj.as_ref());
        let api = Self::api(state, Some(&namespace));
        let uid = obj.uid().unwrap_or_default();

        // ---------------------------------------------------------------------
        // Step 1: draw the first subnet of the pool, further ones appear on
        // demand when ports exhaust the existing ones

        if state.subnets.by_cr_uid(&uid).is_empty() {
            let Some(vpc) = state.vpcs.by_namespace(&namespace) else {
                return Err(ReconcilerError::VpcUnready(namespace));
            };
            let vpc_path: nsx::path::VpcPath = vpc
                .path
                .as_deref()
                .ok_or_else(|| ReconcilerError::VpcUnready(namespace.to_owned()))?
                .parse()
                .map_err(nsx::Error::Path)?;

            let desired = crate::svc::nsx::model::VpcSubnet {
                id: format!("{name}-0_{}", &uid[..uid.len().min(5)]),
                display_name: format!("{name}-0"),
                tags: crate::svc::nsx::tag::ownership(
                    state.cluster(),
                    Some(&namespace),
                    &name,
                    &uid,
                    CREATED_FOR,
                ),
                access_mode: Some(
                    obj.spec
                        .access_mode
                        .unwrap_or(AccessMode::Private)
                        .to_string(),
                ),
                ipv4_subnet_size: obj
                    .spec
                    .ipv4_subnet_size
                    .or(Some(state.config.cluster.default_subnet_size)),
                ..Default::default()
            };

            info!(namespace = &namespace, set = &name, "Draw first subnet for the pool");
            state.subnets.apply(&vpc_path, desired).await?;
        }

        // ---------------------------------------------------------------------
        // Step 2: reflect the subnets drawn from this pool into the status

        let drawn: Vec<SubnetInfo> = state
            .subnets
            .by_cr_uid(&uid)
            .iter()
            .filter_map(|subnet| {
                subnet.path.as_ref().map(|path| SubnetInfo {
                    nsx_path: path.to_owned(),
                    network_addresses: subnet.ip_addresses.to_owned(),
                })
            })
            .collect();

        let mut modified = (*obj).to_owned();
        modified.status.get_or_insert_with(Status::default).subnets = drawn;

        let patch = resource::diff(obj.as_ref(), &modified).map_err(kube::Error::SerdeError)?;
        resource::patch_status(state.kube.to_owned(), modified, patch).await?;

        // ---------------------------------------------------------------------
        // Step 3: flip the condition

        status::update_success(
            state,
            &api,
            Self::KIND,
            obj.as_ref(),
            &format!("Subnet set '{namespace}/{name}' in sync"),
        )
        .await?;

        Ok(Outcome::Done)
    }

    async fn cleanup(&self, state: &Arc<State>, obj: Arc<SubnetSet>) -> Result<Outcome, ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj.as_ref());
        let uid = obj.uid().unwrap_or_default();

        // ---------------------------------------------------------------------
        // Step 1: deny deletion while a binding map still targets the pool

        let bindings: Api<super::binding_map::SubnetConnectionBindingMap> =
            Api::namespaced(state.kube.to_owned(), &namespace);
        let referencing = bindings
            .list(&ListParams::default().fields(&format!("spec.targetSubnetSetName={name}")))
            .await?;

        if let Some(binding) = referencing.items.first() {
            let err = ReconcilerError::Referenced(binding.name_any());
            warn!(
                namespace = &namespace,
                name = &name,
                binding = binding.name_any(),
                "Refuse subnet set deletion, still referenced"
            );
            status::delete_fail(state, Self::KIND, obj.as_ref(), &err.to_string()).await;

            return Err(err);
        }

        // ---------------------------------------------------------------------
        // Step 2: delete every subnet drawn from the pool

        for subnet in state.subnets.by_cr_uid(&uid) {
            if let Some(path) = &subnet.path {
                info!(path = path, "Delete subnet drawn from deleted pool");
                state.subnets.delete(path).await?;
            }
        }

        status::delete_success(state, Self::KIND, obj.as_ref(), "Subnet set deleted").await;
        Ok(Outcome::Done)
    }

    async fn cleanup_absent(
        &self,
        state: &Arc<State>,
        request: &Request,
    ) -> Result<(), ReconcilerError> {
        let Some(namespace) = request.namespace.as_deref() else {
            return Ok(());
        };

        for subnet in state.subnets.by_cr_name(namespace, &request.name) {
            if let Some(path) = &subnet.path {
                info!(path = path, "Remove fabric subnet left behind by deleted pool");
                state.subnets.delete(path).await?;
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// NamespaceMapper structure

/// fan-out source, a change of namespace labels enqueues every subnet set of
/// that namespace
pub struct NamespaceMapper;

#[async_trait]
impl Mapper<Namespace> for NamespaceMapper {
    async fn map(&self, obj: &Namespace, state: &Arc<State>) -> Vec<Request> {
        let namespace = obj.name_any();
        let api: Api<SubnetSet> = Api::namespaced(state.kube.to_owned(), &namespace);

        match api.list(&ListParams::default()).await {
            Err(err) => {
                warn!(
                    namespace = &namespace,
                    error = err.to_string(),
                    "Failed to list subnet sets for fan-out"
                );

                vec![]
            }
            Ok(sets) => sets
                .items
                .iter()
                .map(|set| Request::new(Some(&namespace), &set.name_any()))
                .collect(),
        }
    }

    /// only label changes matter for this source
    fn fingerprint(&self, obj: &Namespace) -> Option<u64> {
        Some(fingerprint(&obj.metadata.labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_subnet_sets_should_carry_the_documented_access_modes() {
        let vm = default_vm(64);
        let pod = default_pod(64);

        assert_eq!(vm.name_any(), "default-vm-subnetset");
        assert_eq!(vm.spec.access_mode, Some(AccessMode::Private));
        assert_eq!(pod.name_any(), "default-pod-subnetset");
        assert_eq!(pod.spec.access_mode, Some(AccessMode::Project));
    }

    #[test]
    fn namespace_fingerprint_should_only_track_labels() {
        let mapper = NamespaceMapper;
        let mut ns = Namespace::default();
        ns.metadata.name = Some("ns-a".to_string());
        let before = mapper.fingerprint(&ns);

        // annotation churn is a no-op for this source
        ns.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert("whatever".to_string(), "value".to_string());
        assert_eq!(mapper.fingerprint(&ns), before);

        ns.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("team".to_string(), "network".to_string());
        assert_ne!(mapper.fingerprint(&ns), before);
    }
}

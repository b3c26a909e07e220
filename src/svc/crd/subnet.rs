//! # Subnet custom resource
//!
//! This module provide the subnet custom resource and its reconciliation
//! loop, a subnet is either user-declared or represents a shared fabric
//! subnet imported from another vpc

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{Api, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::svc::{
    crd::{AccessMode, HasConditions, ANNOTATION_ASSOCIATED_RESOURCE},
    k8s::{
        resource, status, Classify, Kind, Outcome, Reconcile, Request, State,
    },
    nsx::{
        self,
        model::VpcSubnet,
        path::AssociatedKey,
        tag,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const SUBNET_FINALIZER: &str = "nsx.vmware.com/subnet";
pub const CREATED_FOR: &str = "subnet";

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "vpc.nsx.vmware.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "Subnet")]
#[kube(singular = "subnet")]
#[kube(plural = "subnets")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct Spec {
    #[serde(rename = "accessMode", default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,
    #[serde(rename = "ipv4SubnetSize", default, skip_serializing_if = "Option::is_none")]
    pub ipv4_subnet_size: Option<u32>,
    #[serde(rename = "ipAddresses", default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "nsxPath", default, skip_serializing_if = "Option::is_none")]
    pub nsx_path: Option<String>,
    #[serde(rename = "networkAddresses", default, skip_serializing_if = "Vec::is_empty")]
    pub network_addresses: Vec<String>,
    #[serde(rename = "conditions", default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// -----------------------------------------------------------------------------
// Subnet implementation

impl HasConditions for Subnet {
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

impl Subnet {
    /// associated-resource key when this resource represents a shared
    /// fabric subnet from another vpc
    pub fn associated_resource(&self) -> Option<Result<AssociatedKey, nsx::path::Error>> {
        self.annotations()
            .get(ANNOTATION_ASSOCIATED_RESOURCE)
            .map(|value| value.parse())
    }

    pub fn is_shared(&self) -> bool {
        self.annotations().contains_key(ANNOTATION_ASSOCIATED_RESOURCE)
    }

    pub fn nsx_path(&self) -> Option<&str> {
        self.status.as_ref().and_then(|status| status.nsx_path.as_deref())
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to execute request on the fabric, {0}")]
    Fabric(nsx::Error),
    #[error("the vpc for namespace '{0}' is not realized yet")]
    VpcUnready(String),
    #[error("the shared subnet '{0}' does not exist on the fabric")]
    SharedSubnetAbsent(String),
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
            Self::VpcUnready(_) | Self::SharedSubnetAbsent(_) => Kind::DependencyUnready,
        }
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl Reconciler {
    /// patch the realized identity into the resource's status
    async fn record_realized(
        state: &Arc<State>,
        origin: &Subnet,
        path: &str,
        addresses: &[String],
    ) -> Result<(), ReconcilerError> {
        let mut modified = origin.to_owned();
        let subnet_status = modified.status.get_or_insert_with(Status::default);
        subnet_status.nsx_path = Some(path.to_string());
        subnet_status.network_addresses = addresses.to_vec();

        let patch = resource::diff(origin, &modified).map_err(kube::Error::SerdeError)?;
        resource::patch_status(state.kube.to_owned(), modified, patch).await?;

        Ok(())
    }

    fn desired(obj: &Subnet, state: &State) -> VpcSubnet {
        let (namespace, name) = resource::namespaced_name(obj);
        let uid = obj.uid().unwrap_or_default();

        VpcSubnet {
            id: format!("{name}_{}", &uid[..uid.len().min(5)]),
            display_name: name.to_owned(),
            tags: tag::ownership(state.cluster(), Some(&namespace), &name, &uid, CREATED_FOR),
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
            ip_addresses: obj.spec.ip_addresses.to_owned(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    type Resource = Subnet;
    type Error = ReconcilerError;

    const KIND: &'static str = "Subnet";
    const FINALIZER: Option<&'static str> = Some(SUBNET_FINALIZER);

    fn api(state: &State, namespace: Option<&str>) -> Api<Subnet> {
        match namespace {
            Some(namespace) => Api::namespaced(state.kube.to_owned(), namespace),
            None => Api::all(state.kube.to_owned()),
        }
    }

    fn validate(&self, obj: &Subnet) -> Result<(), String> {
        if let Some(size) = obj.spec.ipv4_subnet_size {
            if size < 16 || !size.is_power_of_two() {
                return Err(format!(
                    "ipv4SubnetSize must be a power of two of at least 16, got {size}"
                ));
            }
        }

        if let Some(Err(err)) = obj.associated_resource() {
            return Err(format!("invalid associated resource annotation, {err}"));
        }

        Ok(())
    }

    async fn rejected(&self, state: &Arc<State>, obj: Arc<Subnet>, message: &str) {
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

    async fn apply(&self, state: &Arc<State>, obj: Arc<Subnet>) -> Result<Outcome, ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj.as_ref());
        let api = Self::api(state, Some(&namespace));

        // ---------------------------------------------------------------------
        // Step 1: shared subnets are externally owned, only resolve and
        // record them

        if let Some(key) = obj.associated_resource() {
            let key = key.map_err(nsx::Error::Path)?;
            let Some(shared) = state.subnets.get_by_associated(&key).await? else {
                let err = ReconcilerError::SharedSubnetAbsent(key.to_string());
                status::update_fail(
                    state,
                    &api,
                    Self::KIND,
                    obj.as_ref(),
                    status::REASON_DEPENDENCY_UNREADY,
                    &err.to_string(),
                )
                .await?;

                return Err(err);
            };

            if let Some(path) = &shared.path {
                Self::record_realized(state, obj.as_ref(), path, &shared.ip_addresses).await?;
            }

            // keeps the map equivalent to the annotated resources, also
            // across restarts
            state.shared_subnets.register(&key, &namespace, &name);

            status::update_success(
                state,
                &api,
                Self::KIND,
                obj.as_ref(),
                &format!("Shared subnet '{key}' resolved"),
            )
            .await?;

            return Ok(Outcome::Done);
        }

        // ---------------------------------------------------------------------
        // Step 2: realize the subnet under the namespace's vpc

        let Some(vpc) = state.vpcs.by_namespace(&namespace) else {
            return Err(ReconcilerError::VpcUnready(namespace));
        };

        let vpc_path = vpc
            .path
            .as_deref()
            .ok_or_else(|| ReconcilerError::VpcUnready(namespace.to_owned()))?
            .parse()
            .map_err(nsx::Error::Path)?;

        let realized = state
            .subnets
            .apply(&vpc_path, Self::desired(obj.as_ref(), state))
            .await?;

        // ---------------------------------------------------------------------
        // Step 3: record the realized identity and flip the condition

        if let Some(path) = &realized.path {
            Self::record_realized(state, obj.as_ref(), path, &realized.ip_addresses).await?;
        }

        status::update_success(
            state,
            &api,
            Self::KIND,
            obj.as_ref(),
            &format!("Subnet '{namespace}/{name}' realized"),
        )
        .await?;

        Ok(Outcome::Done)
    }

    async fn cleanup(&self, state: &Arc<State>, obj: Arc<Subnet>) -> Result<Outcome, ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj.as_ref());

        // shared representations never delete the fabric object they point at
        if let Some(Ok(key)) = obj.associated_resource() {
            info!(
                namespace = &namespace,
                name = &name,
                key = key.to_string(),
                "Deregister shared subnet representation"
            );
            state.shared_subnets.deregister(&key, &namespace, &name);
            status::delete_success(state, Self::KIND, obj.as_ref(), "Shared subnet released").await;

            return Ok(Outcome::Done);
        }

        let uid = obj.uid().unwrap_or_default();
        for owned in state.subnets.by_cr_uid(&uid) {
            if let Some(path) = &owned.path {
                state.subnets.delete(path).await?;
            }
        }

        status::delete_success(state, Self::KIND, obj.as_ref(), "Subnet deleted").await;
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

        for owned in state.subnets.by_cr_name(namespace, &request.name) {
            if let Some(path) = &owned.path {
                info!(path = path, "Remove fabric subnet left behind by deleted resource");
                state.subnets.delete(path).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(size: Option<u32>) -> Subnet {
        Subnet::new(
            "subnet-a",
            Spec {
                ipv4_subnet_size: size,
                ..Default::default()
            },
        )
    }

    #[test]
    fn validate_should_reject_odd_subnet_sizes() {
        let reconciler = Reconciler::default();

        assert!(reconciler.validate(&subnet(None)).is_ok());
        assert!(reconciler.validate(&subnet(Some(64))).is_ok());
        assert!(reconciler.validate(&subnet(Some(48))).is_err());
        assert!(reconciler.validate(&subnet(Some(8))).is_err());
    }

    #[test]
    fn validate_should_reject_malformed_associated_resource() {
        let reconciler = Reconciler::default();
        let mut obj = subnet(None);
        obj.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_ASSOCIATED_RESOURCE.to_string(), "p:v".to_string());

        assert!(reconciler.validate(&obj).is_err());

        obj.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_ASSOCIATED_RESOURCE.to_string(), "p:v:s".to_string());

        assert!(reconciler.validate(&obj).is_ok());
        assert!(obj.is_shared());
    }

    #[test]
    fn dependency_failures_should_requeue_after_fixed_delay() {
        assert_eq!(
            ReconcilerError::VpcUnready("ns-a".to_string()).kind(),
            Kind::DependencyUnready
        );
        assert_eq!(
            ReconcilerError::SharedSubnetAbsent("p:v:s".to_string()).kind(),
            Kind::DependencyUnready
        );
    }
}

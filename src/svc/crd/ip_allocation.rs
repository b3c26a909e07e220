//! # IPAddressAllocation custom resource
//!
//! This module provide the ip address allocation custom resource drawing a
//! block of addresses from the namespace's vpc

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{Api, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::svc::{
    crd::HasConditions,
    k8s::{resource, status, Classify, Kind, Outcome, Reconcile, State},
    nsx::{self, model, tag},
};

// -----------------------------------------------------------------------------
// Constants

pub const IP_ALLOCATION_FINALIZER: &str = "nsx.vmware.com/ipaddressallocation";
pub const CREATED_FOR: &str = "ipaddressallocation";

// -----------------------------------------------------------------------------
// Visibility enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Visibility {
    #[default]
    External,
    Private,
}

impl Visibility {
    fn as_fabric(&self) -> &'static str {
        match self {
            Self::External => "EXTERNAL",
            Self::Private => "PRIVATE",
        }
    }
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "vpc.nsx.vmware.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "IPAddressAllocation")]
#[kube(singular = "ipaddressallocation")]
#[kube(plural = "ipaddressallocations")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct Spec {
    #[serde(rename = "ipAddressBlockVisibility", default)]
    pub ip_address_block_visibility: Visibility,
    #[serde(rename = "allocationSize")]
    pub allocation_size: u32,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "allocationIPs", default, skip_serializing_if = "Option::is_none")]
    pub allocation_ips: Option<String>,
    #[serde(rename = "conditions", default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for IPAddressAllocation {
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
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to execute request on the fabric, {0}")]
    Fabric(nsx::Error),
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
    type Resource = IPAddressAllocation;
    type Error = ReconcilerError;

    const KIND: &'static str = "IPAddressAllocation";
    const FINALIZER: Option<&'static str> = Some(IP_ALLOCATION_FINALIZER);

    fn api(state: &State, namespace: Option<&str>) -> Api<IPAddressAllocation> {
        match namespace {
            Some(namespace) => Api::namespaced(state.kube.to_owned(), namespace),
            None => Api::all(state.kube.to_owned()),
        }
    }

    fn validate(&self, obj: &IPAddressAllocation) -> Result<(), String> {
        if obj.spec.allocation_size == 0 || !obj.spec.allocation_size.is_power_of_two() {
            return Err(format!(
                "allocationSize must be a non-zero power of two, got {}",
                obj.spec.allocation_size
            ));
        }

        Ok(())
    }

    async fn rejected(&self, state: &Arc<State>, obj: Arc<IPAddressAllocation>, message: &str) {
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

    async fn apply(
        &self,
        state: &Arc<State>,
        obj: Arc<IPAddressAllocation>,
    ) -> Result<Outcome, ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj.as_ref());
        let api = Self::api(state, Some(&namespace));
        let uid = obj.uid().unwrap_or_default();

        // ---------------------------------------------------------------------
        // Step 1: allocate from the namespace's vpc

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
            .allocations
            .apply(
                &vpc_path,
                model::IpAddressAllocation {
                    id: format!("{name}_{}", &uid[..uid.len().min(5)]),
                    display_name: name.to_owned(),
                    tags: tag::ownership(state.cluster(), Some(&namespace), &name, &uid, CREATED_FOR),
                    allocation_size: Some(obj.spec.allocation_size),
                    ip_block_visibility: Some(
                        obj.spec.ip_address_block_visibility.as_fabric().to_string(),
                    ),
                    ..Default::default()
                },
            )
            .await?;

        // ---------------------------------------------------------------------
        // Step 2: record the allocated addresses and flip the condition

        let mut modified = (*obj).to_owned();
        modified
            .status
            .get_or_insert_with(Status::default)
            .allocation_ips = realized.allocation_ips.to_owned();

        let patch = resource::diff(obj.as_ref(), &modified).map_err(kube::Error::SerdeError)?;
        resource::patch_status(state.kube.to_owned(), modified, patch).await?;

        status::update_success(
            state,
            &api,
            Self::KIND,
            obj.as_ref(),
            &format!("Allocation '{namespace}/{name}' realized"),
        )
        .await?;

        Ok(Outcome::Done)
    }

    async fn cleanup(
        &self,
        state: &Arc<State>,
        obj: Arc<IPAddressAllocation>,
    ) -> Result<Outcome, ReconcilerError> {
        let uid = obj.uid().unwrap_or_default();

        for allocation in state.allocations.by_cr_uid(&uid) {
            if let Some(path) = &allocation.path {
                info!(path = path, "Release ip address allocation");
                state.allocations.delete(path).await?;
            }
        }

        status::delete_success(state, Self::KIND, obj.as_ref(), "Allocation released").await;
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_should_require_power_of_two_sizes() {
        let reconciler = Reconciler::default();
        let allocation = |size: u32| {
            IPAddressAllocation::new(
                "alloc-1",
                Spec {
                    allocation_size: size,
                    ..Default::default()
                },
            )
        };

        assert!(reconciler.validate(&allocation(8)).is_ok());
        assert!(reconciler.validate(&allocation(1)).is_ok());
        assert!(reconciler.validate(&allocation(0)).is_err());
        assert!(reconciler.validate(&allocation(24)).is_err());
    }
}

//! # SubnetPort custom resource
//!
//! This module provide the subnet port custom resource, an attachment point
//! on a subnet or on a subnet drawn from a subnet set

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{Api, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::svc::{
    crd::{subnet::Subnet, HasConditions},
    k8s::{resource, status, Classify, Kind, Outcome, Reconcile, State},
    nsx::{
        self,
        client::POLICY_BASE,
        model::{PortAttachment, VpcSubnetPort},
        tag,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const SUBNET_PORT_FINALIZER: &str = "nsx.vmware.com/subnetport";
pub const CREATED_FOR: &str = "subnetport";

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "vpc.nsx.vmware.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "SubnetPort")]
#[kube(singular = "subnetport")]
#[kube(plural = "subnetports")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct Spec {
    #[serde(rename = "subnet", default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(rename = "subnetSet", default, skip_serializing_if = "Option::is_none")]
    pub subnet_set: Option<String>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "nsxPath", default, skip_serializing_if = "Option::is_none")]
    pub nsx_path: Option<String>,
    #[serde(rename = "attachmentID", default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    #[serde(rename = "conditions", default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for SubnetPort {
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
    #[error("the parent subnet '{0}' is not realized yet")]
    ParentUnready(String),
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
            Self::ParentUnready(_) => Kind::DependencyUnready,
        }
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl Reconciler {
    /// realized path of the parent the port attaches to
    async fn parent_path(
        state: &Arc<State>,
        namespace: &str,
        obj: &SubnetPort,
    ) -> Result<String, ReconcilerError> {
        if let Some(subnet) = &obj.spec.subnet {
            let api: Api<Subnet> = Api::namespaced(state.kube.to_owned(), namespace);
            return api
                .get_opt(subnet)
                .await?
                .as_ref()
                .and_then(|subnet| subnet.nsx_path())
                .map(str::to_string)
                .ok_or_else(|| ReconcilerError::ParentUnready(subnet.to_owned()));
        }

        let set = obj.spec.subnet_set.as_deref().unwrap_or_default();
        state
            .subnets
            .by_cr_name(namespace, set)
            .iter()
            .find_map(|subnet| subnet.path.to_owned())
            .ok_or_else(|| ReconcilerError::ParentUnready(set.to_string()))
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    type Resource = SubnetPort;
    type Error = ReconcilerError;

    const KIND: &'static str = "SubnetPort";
    const FINALIZER: Option<&'static str> = Some(SUBNET_PORT_FINALIZER);

    fn api(state: &State, namespace: Option<&str>) -> Api<SubnetPort> {
        match namespace {
            Some(namespace) => Api::namespaced(state.kube.to_owned(), namespace),
            None => Api::all(state.kube.to_owned()),
        }
    }

    fn validate(&self, obj: &SubnetPort) -> Result<(), String> {
        match (&obj.spec.subnet, &obj.spec.subnet_set) {
            (None, None) => Err("one of subnet or subnetSet must be set".to_string()),
            (Some(_), Some(_)) => Err("subnet and subnetSet are mutually exclusive".to_string()),
            _ => Ok(()),
        }
    }

    async fn rejected(&self, state: &Arc<State>, obj: Arc<SubnetPort>, message: &str) {
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

    async fn apply(&self, state: &Arc<State>, obj: Arc<SubnetPort>) -> Result<Outcome, ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj.as_ref());
        let api = Self::api(state, Some(&namespace));
        let uid = obj.uid().unwrap_or_default();

        // ---------------------------------------------------------------------
        // Step 1: the parent must be realized before any port attaches

        let parent = Self::parent_path(state, &namespace, obj.as_ref()).await?;

        // ---------------------------------------------------------------------
        // Step 2: realize the port under the parent subnet

        let port = VpcSubnetPort {
            id: format!("{name}_{}", &uid[..uid.len().min(5)]),
            display_name: name.to_owned(),
            tags: tag::ownership(state.cluster(), Some(&namespace), &name, &uid, CREATED_FOR),
            attachment: Some(PortAttachment {
                id: Some(uid.to_owned()),
                allocate_addresses: Some("DHCP".to_string()),
            }),
            ..Default::default()
        };

        let path = format!("{parent}/ports/{}", port.id);
        let realized: VpcSubnetPort = state
            .nsx
            .put(&format!("{POLICY_BASE}{path}"), &VpcSubnetPort { path: Some(path.to_owned()), ..port })
            .await?;

        // ---------------------------------------------------------------------
        // Step 3: record the realized identity and flip the condition

        let mut modified = (*obj).to_owned();
        let port_status = modified.status.get_or_insert_with(Status::default);
        port_status.nsx_path = Some(path.to_owned());
        port_status.attachment_id = realized.attachment.and_then(|attachment| attachment.id);

        let patch = resource::diff(obj.as_ref(), &modified).map_err(kube::Error::SerdeError)?;
        resource::patch_status(state.kube.to_owned(), modified, patch).await?;

        status::update_success(
            state,
            &api,
            Self::KIND,
            obj.as_ref(),
            &format!("Subnet port '{namespace}/{name}' attached"),
        )
        .await?;

        Ok(Outcome::Done)
    }

    async fn cleanup(&self, state: &Arc<State>, obj: Arc<SubnetPort>) -> Result<Outcome, ReconcilerError> {
        if let Some(path) = obj.status.as_ref().and_then(|status| status.nsx_path.as_deref()) {
            info!(path = path, "Delete subnet port on the fabric");
            state.nsx.delete(&format!("{POLICY_BASE}{path}")).await?;
        }

        status::delete_success(state, Self::KIND, obj.as_ref(), "Subnet port detached").await;
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(subnet: Option<&str>, set: Option<&str>) -> SubnetPort {
        SubnetPort::new(
            "port-1",
            Spec {
                subnet: subnet.map(str::to_string),
                subnet_set: set.map(str::to_string),
            },
        )
    }

    #[test]
    fn validate_should_require_exactly_one_parent() {
        let reconciler = Reconciler::default();

        assert!(reconciler.validate(&port(Some("subnet-a"), None)).is_ok());
        assert!(reconciler.validate(&port(None, Some("pool"))).is_ok());
        assert!(reconciler.validate(&port(None, None)).is_err());
        assert!(reconciler.validate(&port(Some("subnet-a"), Some("pool"))).is_err());
    }
}

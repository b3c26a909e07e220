//! # SubnetConnectionBindingMap custom resource
//!
//! This module provide the binding map custom resource declaring one subnet
//! as a vlan-tagged child of another

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{Api, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::svc::{
    crd::{subnet::Subnet, HasConditions},
    k8s::{
        controller::Mapper,
        resource, status, Classify, Kind, Outcome, Reconcile, Request, State,
    },
    nsx::{self, model, tag},
};

// -----------------------------------------------------------------------------
// Constants

pub const BINDING_MAP_FINALIZER: &str = "nsx.vmware.com/subnetconnectionbindingmap";
pub const CREATED_FOR: &str = "subnetconnectionbindingmap";

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "vpc.nsx.vmware.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "SubnetConnectionBindingMap")]
#[kube(singular = "subnetconnectionbindingmap")]
#[kube(plural = "subnetconnectionbindingmaps")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct Spec {
    /// the subnet turned into a vlan-tagged child
    #[serde(rename = "subnetName")]
    pub subnet_name: String,
    #[serde(rename = "targetSubnetName", default, skip_serializing_if = "Option::is_none")]
    pub target_subnet_name: Option<String>,
    #[serde(rename = "targetSubnetSetName", default, skip_serializing_if = "Option::is_none")]
    pub target_subnet_set_name: Option<String>,
    #[serde(rename = "vlanTrafficTag")]
    pub vlan_traffic_tag: i64,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "nsxPath", default, skip_serializing_if = "Option::is_none")]
    pub nsx_path: Option<String>,
    #[serde(rename = "conditions", default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for SubnetConnectionBindingMap {
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
    #[error("subnet '{0}' is not realized yet")]
    SubnetUnready(String),
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
            Self::SubnetUnready(_) => Kind::DependencyUnready,
        }
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl Reconciler {
    /// realized path of the subnet custom resource with the given name
    async fn subnet_path(
        state: &Arc<State>,
        namespace: &str,
        name: &str,
    ) -> Result<String, ReconcilerError> {
        let api: Api<Subnet> = Api::namespaced(state.kube.to_owned(), namespace);
        let subnet = api
            .get_opt(name)
            .await?
            .ok_or_else(|| ReconcilerError::SubnetUnready(name.to_string()))?;

        subnet
            .nsx_path()
            .map(str::to_string)
            .ok_or_else(|| ReconcilerError::SubnetUnready(name.to_string()))
    }

    /// realized path of the target, either a subnet or one subnet drawn from
    /// the target set
    async fn target_path(
        state: &Arc<State>,
        namespace: &str,
        obj: &SubnetConnectionBindingMap,
    ) -> Result<String, ReconcilerError> {
        if let Some(target) = &obj.spec.target_subnet_name {
            return Self::subnet_path(state, namespace, target).await;
        }

        let set = obj
            .spec
            .target_subnet_set_name
            .as_deref()
            .unwrap_or_default();

        state
            .subnets
            .by_cr_name(namespace, set)
            .iter()
            .find_map(|subnet| subnet.path.to_owned())
            .ok_or_else(|| ReconcilerError::SubnetUnready(set.to_string()))
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    type Resource = SubnetConnectionBindingMap;
    type Error = ReconcilerError;

    const KIND: &'static str = "SubnetConnectionBindingMap";
    const FINALIZER: Option<&'static str> = Some(BINDING_MAP_FINALIZER);

    fn api(state: &State, namespace: Option<&str>) -> Api<SubnetConnectionBindingMap> {
        match namespace {
            Some(namespace) => Api::namespaced(state.kube.to_owned(), namespace),
            None => Api::all(state.kube.to_owned()),
        }
    }

    fn validate(&self, obj: &SubnetConnectionBindingMap) -> Result<(), String> {
        match (&obj.spec.target_subnet_name, &obj.spec.target_subnet_set_name) {
            (None, None) => {
                return Err("one of targetSubnetName or targetSubnetSetName must be set".to_string())
            }
            (Some(_), Some(_)) => {
                return Err(
                    "targetSubnetName and targetSubnetSetName are mutually exclusive".to_string(),
                )
            }
            _ => {}
        }

        if !(0..=4095).contains(&obj.spec.vlan_traffic_tag) {
            return Err(format!(
                "vlanTrafficTag must be between 0 and 4095, got {}",
                obj.spec.vlan_traffic_tag
            ));
        }

        Ok(())
    }

    async fn rejected(&self, state: &Arc<State>, obj: Arc<SubnetConnectionBindingMap>, message: &str) {
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
        obj: Arc<SubnetConnectionBindingMap>,
    ) -> Result<Outcome, ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj.as_ref());
        let api = Self::api(state, Some(&namespace));
        let uid = obj.uid().unwrap_or_default();

        // ---------------------------------------------------------------------
        // Step 1: both endpoints must be realized before the binding exists

        let child_path = Self::subnet_path(state, &namespace, &obj.spec.subnet_name).await?;
        let target_path = Self::target_path(state, &namespace, obj.as_ref()).await?;

        // ---------------------------------------------------------------------
        // Step 2: realize the binding under the child subnet

        let realized = state
            .binding_maps
            .apply(
                &child_path,
                model::SubnetConnectionBindingMap {
                    id: format!("{name}_{}", &uid[..uid.len().min(5)]),
                    display_name: name.to_owned(),
                    tags: tag::ownership(state.cluster(), Some(&namespace), &name, &uid, CREATED_FOR),
                    subnet_path: Some(target_path),
                    vlan_traffic_tag: Some(obj.spec.vlan_traffic_tag),
                    ..Default::default()
                },
            )
            .await?;

        // ---------------------------------------------------------------------
        // Step 3: record the realized identity and flip the condition

        let mut modified = (*obj).to_owned();
        modified.status.get_or_insert_with(Status::default).nsx_path = realized.path.to_owned();

        let patch = resource::diff(obj.as_ref(), &modified).map_err(kube::Error::SerdeError)?;
        resource::patch_status(state.kube.to_owned(), modified, patch).await?;

        status::update_success(
            state,
            &api,
            Self::KIND,
            obj.as_ref(),
            &format!("Binding map '{namespace}/{name}' realized"),
        )
        .await?;

        Ok(Outcome::Done)
    }

    async fn cleanup(
        &self,
        state: &Arc<State>,
        obj: Arc<SubnetConnectionBindingMap>,
    ) -> Result<Outcome, ReconcilerError> {
        let uid = obj.uid().unwrap_or_default();

        for binding in state.binding_maps.by_cr_uid(&uid) {
            if let Some(path) = &binding.path {
                info!(path = path, "Delete subnet connection binding map");
                state.binding_maps.delete(path).await?;
            }
        }

        status::delete_success(state, Self::KIND, obj.as_ref(), "Binding map deleted").await;
        Ok(Outcome::Done)
    }
}

// -----------------------------------------------------------------------------
// TargetKind enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TargetKind {
    Subnets,
    SubnetSets,
}

// -----------------------------------------------------------------------------
// TargetMapper structure

/// fan-out source, a binding map change enqueues its endpoints, and the
/// previous target as well when the target moved
pub struct TargetMapper {
    kind: TargetKind,
    seen: Mutex<HashMap<String, Vec<String>>>,
}

impl TargetMapper {
    pub fn new(kind: TargetKind) -> Self {
        Self {
            kind,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// endpoints to enqueue, remembering the previous targets so a moved
    /// binding also wakes up its former endpoint
    pub fn requests(&self, obj: &SubnetConnectionBindingMap) -> Vec<Request> {
        let namespace = obj.namespace();
        let key = format!(
            "{}/{}",
            namespace.as_deref().unwrap_or_default(),
            obj.name_any()
        );

        let current = self.targets(obj);
        let previous = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, current.to_owned())
            .unwrap_or_default();

        let mut names = current;
        for target in previous {
            if !names.contains(&target) {
                names.push(target);
            }
        }

        names
            .iter()
            .map(|name| Request::new(namespace.as_deref(), name))
            .collect()
    }

    fn targets(&self, obj: &SubnetConnectionBindingMap) -> Vec<String> {
        match self.kind {
            TargetKind::Subnets => {
                let mut targets = vec![obj.spec.subnet_name.to_owned()];
                if let Some(target) = &obj.spec.target_subnet_name {
                    targets.push(target.to_owned());
                }

                targets
            }
            TargetKind::SubnetSets => obj
                .spec
                .target_subnet_set_name
                .to_owned()
                .into_iter()
                .collect(),
        }
    }
}

#[async_trait]
impl Mapper<SubnetConnectionBindingMap> for TargetMapper {
    async fn map(&self, obj: &SubnetConnectionBindingMap, _state: &Arc<State>) -> Vec<Request> {
        self.requests(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(subnet: &str, target: Option<&str>, set: Option<&str>, vlan: i64) -> SubnetConnectionBindingMap {
        let mut obj = SubnetConnectionBindingMap::new(
            "binding-1",
            Spec {
                subnet_name: subnet.to_string(),
                target_subnet_name: target.map(str::to_string),
                target_subnet_set_name: set.map(str::to_string),
                vlan_traffic_tag: vlan,
            },
        );
        obj.metadata.namespace = Some("ns-a".to_string());
        obj
    }

    #[test]
    fn validate_should_require_exactly_one_target() {
        let reconciler = Reconciler::default();

        assert!(reconciler.validate(&binding("child", Some("parent"), None, 100)).is_ok());
        assert!(reconciler.validate(&binding("child", None, Some("pool"), 100)).is_ok());
        assert!(reconciler.validate(&binding("child", None, None, 100)).is_err());
        assert!(reconciler
            .validate(&binding("child", Some("parent"), Some("pool"), 100))
            .is_err());
        assert!(reconciler.validate(&binding("child", Some("parent"), None, 5000)).is_err());
    }

    #[test]
    fn mapper_should_enqueue_previous_target_on_move() {
        let mapper = TargetMapper::new(TargetKind::Subnets);

        let first = mapper.requests(&binding("child", Some("parent-1"), None, 100));
        assert_eq!(
            first.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["child", "parent-1"]
        );

        let second = mapper.requests(&binding("child", Some("parent-2"), None, 100));
        assert_eq!(
            second.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["child", "parent-2", "parent-1"]
        );
    }

    #[test]
    fn subnet_set_mapper_should_only_see_set_targets() {
        let mapper = TargetMapper::new(TargetKind::SubnetSets);

        let none = mapper.requests(&binding("child", Some("parent"), None, 100));
        assert!(none.is_empty());

        let set = mapper.requests(&binding("child", None, Some("pool"), 100));
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].name, "pool");
        assert_eq!(set[0].namespace.as_deref(), Some("ns-a"));
    }
}

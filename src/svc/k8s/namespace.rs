//! # Namespace module
//!
//! This module provide the namespace lifecycle reconciler, binding each
//! namespace to a network configuration, realizing its vpc, creating the
//! default subnet sets and syncing shared subnets

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{api::ListParams, Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::svc::{
    crd::{
        network_config::{self, VPCNetworkConfiguration},
        network_info::{self, NetworkInfo, VpcState},
        subnet::Subnet,
        subnet_set::{self, SubnetSet, DEFAULT_POD_SUBNET_SET, DEFAULT_VM_SUBNET_SET},
        ANNOTATION_NETWORK_CONFIG, ANNOTATION_SYSTEM, ANNOTATION_VPC_ERROR,
    },
    k8s::{
        controller::{fingerprint, Mapper},
        recorder, shared, status, Classify, Kind, Outcome, Reconcile, Request, State,
    },
    nsx::{
        self,
        model::Vpc,
        path::{ProjectPath, VpcPath},
        tag,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const CREATED_FOR: &str = "namespace";

pub const LABEL_SUPERVISOR_SERVICE: &str = "vmware-system/supervisor-service";

/// vpc name reserved for supervisor services, namespaces landing on it do
/// not get default subnet sets
pub const SVSERVICE_VPC: &str = "svc-vpc";

// -----------------------------------------------------------------------------
// NamespaceType enumeration

/// derived, not stored
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum NamespaceType {
    System,
    SvService,
    Normal,
}

/// classify the namespace from its annotations, labels and the vpc it lands
/// on
pub fn classify(namespace: &Namespace, vpc_name: Option<&str>) -> NamespaceType {
    if namespace.annotations().contains_key(ANNOTATION_SYSTEM) {
        return NamespaceType::System;
    }

    if namespace.labels().contains_key(LABEL_SUPERVISOR_SERVICE) && vpc_name == Some(SVSERVICE_VPC)
    {
        return NamespaceType::SvService;
    }

    NamespaceType::Normal
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to execute request on the fabric, {0}")]
    Fabric(nsx::Error),
    #[error("network configuration '{0}' does not exist")]
    ConfigAbsent(String),
    #[error("no default network configuration is marked")]
    NoDefaultConfig,
    #[error("pre-created vpc '{0}' does not exist on the fabric")]
    VpcAbsent(String),
    #[error("failed to sync shared subnets, {0}")]
    SharedSubnets(shared::Error),
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

impl From<shared::Error> for ReconcilerError {
    fn from(err: shared::Error) -> Self {
        Self::SharedSubnets(err)
    }
}

impl Classify for ReconcilerError {
    fn kind(&self) -> Kind {
        match self {
            Self::KubeClient(err) => err.kind(),
            Self::Fabric(err) => Classify::kind(err),
            Self::ConfigAbsent(_) | Self::NoDefaultConfig | Self::VpcAbsent(_) => {
                Kind::DependencyUnready
            }
            Self::SharedSubnets(shared::Error::Referenced { .. }) => Kind::Referenced,
            Self::SharedSubnets(_) => Kind::Fatal,
        }
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl Reconciler {
    /// resolve the configuration the namespace is bound to, an explicit
    /// annotation never falls back to the default
    async fn resolve_config(
        state: &Arc<State>,
        namespace: &Namespace,
    ) -> Result<VPCNetworkConfiguration, ReconcilerError> {
        let api: Api<VPCNetworkConfiguration> = Api::all(state.kube.to_owned());

        match namespace.annotations().get(ANNOTATION_NETWORK_CONFIG) {
            Some(name) => api
                .get_opt(name)
                .await?
                .ok_or_else(|| ReconcilerError::ConfigAbsent(name.to_owned())),
            None => network_config::find_default(state.kube.to_owned())
                .await?
                .ok_or(ReconcilerError::NoDefaultConfig),
        }
    }

    /// record or clear the error annotation on the namespace
    async fn write_error_annotation(
        state: &Arc<State>,
        namespace: &str,
        message: Option<&str>,
    ) -> Result<(), kube::Error> {
        let api: Api<Namespace> = Api::all(state.kube.to_owned());
        let patch = match message {
            Some(message) => json!({
                "metadata": { "annotations": { ANNOTATION_VPC_ERROR: message } }
            }),
            None => json!({
                "metadata": { "annotations": { ANNOTATION_VPC_ERROR: null } }
            }),
        };

        api.patch(
            namespace,
            &kube::api::PatchParams::default(),
            &kube::api::Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }

    /// ensure the namespace has one network info resource, reusing the first
    /// one lexicographically when several already exist
    async fn ensure_network_info(
        state: &Arc<State>,
        namespace: &str,
    ) -> Result<NetworkInfo, ReconcilerError> {
        let api: Api<NetworkInfo> = Api::namespaced(state.kube.to_owned(), namespace);
        let mut existing = api.list(&ListParams::default()).await?.items;
        existing.sort_by_key(ResourceExt::name_any);

        if let Some(info) = existing.into_iter().next() {
            return Ok(info);
        }

        info!(namespace = namespace, "Create network info for namespace");
        Ok(api
            .create(
                &kube::api::PostParams::default(),
                &network_info::for_namespace(namespace),
            )
            .await?)
    }

    /// realize the vpc for the namespace, or adopt the configuration's
    /// pre-created one
    async fn ensure_vpc(
        state: &Arc<State>,
        namespace: &Namespace,
        config: &VPCNetworkConfiguration,
    ) -> Result<Vpc, ReconcilerError> {
        if let Some(path) = &config.spec.vpc {
            let parsed: VpcPath = path.parse().map_err(nsx::Error::Path)?;
            return state
                .vpcs
                .get(&parsed)
                .await?
                .map(|vpc| (*vpc).to_owned())
                .ok_or_else(|| ReconcilerError::VpcAbsent(path.to_owned()));
        }

        let name = namespace.name_any();
        let uid = namespace.uid().unwrap_or_default();
        let project: ProjectPath = config
            .spec
            .nsx_project
            .parse()
            .map_err(nsx::Error::Path)?;

        let desired = Vpc {
            id: format!("{}-{name}", state.cluster()),
            display_name: name.to_owned(),
            tags: tag::ownership(state.cluster(), Some(&name), &name, &uid, CREATED_FOR),
            private_ips: config.spec.private_ips.to_owned(),
            ..Default::default()
        };

        Ok(state.vpcs.apply(&project.org, &project.project, desired).await?)
    }

    /// write the realized vpc state into the network info resource
    async fn record_vpc(
        state: &Arc<State>,
        namespace: &str,
        info: &NetworkInfo,
        vpc: &Vpc,
    ) -> Result<(), ReconcilerError> {
        let api: Api<NetworkInfo> = Api::namespaced(state.kube.to_owned(), namespace);
        let realized = VpcState {
            name: vpc.display_name.to_owned(),
            vpc_path: vpc.path.to_owned().unwrap_or_default(),
            private_ips: vpc.private_ips.to_owned(),
            default_snat_ip: vpc.default_snat_ip.to_owned(),
        };

        let mut modified = info.to_owned();
        modified
            .status
            .get_or_insert_with(network_info::Status::default)
            .vpcs = vec![realized];

        let patch = super::resource::diff(info, &modified).map_err(kube::Error::SerdeError)?;
        super::resource::patch_status(state.kube.to_owned(), modified, patch).await?;

        status::update_success(state, &api, "NetworkInfo", info, "VPC realized for namespace")
            .await?;

        Ok(())
    }

    /// create the default subnet sets the namespace type calls for
    async fn ensure_default_subnet_sets(
        state: &Arc<State>,
        namespace: &Namespace,
        config: &VPCNetworkConfiguration,
        vpc: &Vpc,
    ) -> Result<(), ReconcilerError> {
        let name = namespace.name_any();
        let vpc_name = vpc.display_name.as_str();
        let size = config
            .spec
            .default_subnet_size
            .unwrap_or(state.config.cluster.default_subnet_size);

        let mut defaults = vec![];
        match classify(namespace, Some(vpc_name)) {
            // supervisor services bring their own networking
            NamespaceType::SvService => {}
            NamespaceType::System => defaults.push(subnet_set::default_vm(size)),
            NamespaceType::Normal => {
                defaults.push(subnet_set::default_vm(size));
                // pods need the project-visible set, vlan-backed vpcs cannot
                // offer it
                if !vpc.vlan_backed {
                    defaults.push(subnet_set::default_pod(size));
                }
            }
        }

        let api: Api<SubnetSet> = Api::namespaced(state.kube.to_owned(), &name);
        for mut set in defaults {
            set.metadata.namespace = Some(name.to_owned());

            if api.get_opt(&set.name_any()).await?.is_none() {
                info!(namespace = &name, set = set.name_any(), "Create default subnet set");
                api.create(&kube::api::PostParams::default(), &set).await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    type Resource = Namespace;
    type Error = ReconcilerError;

    const KIND: &'static str = "Namespace";
    const FINALIZER: Option<&'static str> = None;

    fn api(state: &State, _namespace: Option<&str>) -> Api<Namespace> {
        Api::all(state.kube.to_owned())
    }

    async fn apply(&self, state: &Arc<State>, obj: Arc<Namespace>) -> Result<Outcome, ReconcilerError> {
        let name = obj.name_any();

        // ---------------------------------------------------------------------
        // Step 1: bind the namespace to its network configuration

        let config = match Self::resolve_config(state, obj.as_ref()).await {
            Ok(config) => config,
            Err(err @ (ReconcilerError::ConfigAbsent(_) | ReconcilerError::NoDefaultConfig)) => {
                warn!(namespace = &name, error = err.to_string(), "Namespace cannot be bound");
                Self::write_error_annotation(state, &name, Some(&err.to_string())).await?;
                let _ = recorder::warning(state.kube.to_owned(), obj.as_ref(), &"Bind", &err.to_string())
                    .await;

                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let config_name = config.name_any();
        debug!(namespace = &name, config = &config_name, "Bind namespace to network configuration");
        state.bindings.bind(&name, &config_name);

        // ---------------------------------------------------------------------
        // Step 2: realize the vpc and its network info

        let info = Self::ensure_network_info(state, &name).await?;
        let vpc = Self::ensure_vpc(state, obj.as_ref(), &config).await?;
        Self::record_vpc(state, &name, &info, &vpc).await?;

        // ---------------------------------------------------------------------
        // Step 3: default subnet sets per namespace type

        Self::ensure_default_subnet_sets(state, obj.as_ref(), &config, &vpc).await?;

        // ---------------------------------------------------------------------
        // Step 4: shared subnets from the configuration list

        shared::sync(state, &name, &config).await?;

        // ---------------------------------------------------------------------
        // Step 5: converged, clear any earlier error

        if obj.annotations().contains_key(ANNOTATION_VPC_ERROR) {
            Self::write_error_annotation(state, &name, None).await?;
        }

        let _ = recorder::normal(
            state.kube.to_owned(),
            obj.as_ref(),
            &"Configure",
            &format!("Namespace bound to network configuration '{config_name}'"),
        )
        .await;

        Ok(Outcome::Done)
    }

    async fn cleanup(&self, state: &Arc<State>, obj: Arc<Namespace>) -> Result<Outcome, ReconcilerError> {
        let name = obj.name_any();

        // ---------------------------------------------------------------------
        // Step 1: drop the default subnet sets

        let sets: Api<SubnetSet> = Api::namespaced(state.kube.to_owned(), &name);
        for set in [DEFAULT_VM_SUBNET_SET, DEFAULT_POD_SUBNET_SET] {
            match sets.delete(set, &Default::default()).await {
                Ok(_) => info!(namespace = &name, set = set, "Delete default subnet set"),
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(err) => return Err(err.into()),
            }
        }

        // ---------------------------------------------------------------------
        // Step 2: drop shared subnet representations, reference-guarded

        let subnets: Api<Subnet> = Api::namespaced(state.kube.to_owned(), &name);
        let mut errors = vec![];
        for item in subnets.list(&ListParams::default()).await?.items {
            if item.associated_resource().is_some() {
                if let Err(err) = shared::delete_representation(state, &subnets, &name, &item).await
                {
                    errors.push(err);
                }
            }
        }

        if !errors.is_empty() {
            return Err(shared::Error::Aggregate { errors }.into());
        }

        // ---------------------------------------------------------------------
        // Step 3: unregister the binding

        state.bindings.unbind(&name);
        info!(namespace = &name, "Namespace unbound");

        Ok(Outcome::Done)
    }

    async fn cleanup_absent(
        &self,
        state: &Arc<State>,
        request: &Request,
    ) -> Result<(), ReconcilerError> {
        state.bindings.unbind(&request.name);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// NamespaceMapper structure

/// identity source of the namespace controller, also feeds the inventory
/// batcher
pub struct NamespaceMapper;

#[async_trait]
impl Mapper<Namespace> for NamespaceMapper {
    async fn map(&self, obj: &Namespace, state: &Arc<State>) -> Vec<Request> {
        state.inventory.add(&obj.name_any());
        vec![Request::from_resource(obj)]
    }

    /// annotation or label churn matters, status updates do not
    fn fingerprint(&self, obj: &Namespace) -> Option<u64> {
        Some(fingerprint(&(
            &obj.metadata.annotations,
            &obj.metadata.labels,
            obj.metadata.deletion_timestamp.is_some(),
        )))
    }
}

// -----------------------------------------------------------------------------
// ConfigMapper structure

/// fan-out source, a configuration change enqueues every bound namespace
pub struct ConfigMapper;

#[async_trait]
impl Mapper<VPCNetworkConfiguration> for ConfigMapper {
    async fn map(&self, obj: &VPCNetworkConfiguration, state: &Arc<State>) -> Vec<Request> {
        state
            .bindings
            .namespaces_for(&obj.name_any())
            .iter()
            .map(|namespace| Request::new(None, namespace))
            .collect()
    }

    /// only spec or marker changes matter for bound namespaces
    fn fingerprint(&self, obj: &VPCNetworkConfiguration) -> Option<u64> {
        let spec = serde_json::to_string(&obj.spec).unwrap_or_default();
        Some(fingerprint(&(spec, obj.is_default())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace(annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Namespace {
        let mut ns = Namespace::default();
        ns.metadata.name = Some("ns-a".to_string());
        ns.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        ns.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        ns
    }

    #[test]
    fn classify_should_prioritize_the_system_annotation() {
        let ns = namespace(
            &[(ANNOTATION_SYSTEM, "true")],
            &[(LABEL_SUPERVISOR_SERVICE, "true")],
        );

        assert_eq!(classify(&ns, Some(SVSERVICE_VPC)), NamespaceType::System);
    }

    #[test]
    fn classify_should_require_both_label_and_vpc_for_svservice() {
        let labelled = namespace(&[], &[(LABEL_SUPERVISOR_SERVICE, "true")]);

        assert_eq!(classify(&labelled, Some(SVSERVICE_VPC)), NamespaceType::SvService);
        assert_eq!(classify(&labelled, Some("other-vpc")), NamespaceType::Normal);
        assert_eq!(classify(&namespace(&[], &[]), Some(SVSERVICE_VPC)), NamespaceType::Normal);
    }

    #[test]
    fn namespace_fingerprint_should_ignore_status_churn() {
        let mapper = NamespaceMapper;
        let mut ns = namespace(&[(ANNOTATION_NETWORK_CONFIG, "nc-1")], &[]);
        let before = mapper.fingerprint(&ns);

        ns.status = Some(Default::default());
        assert_eq!(mapper.fingerprint(&ns), before);

        ns.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_NETWORK_CONFIG.to_string(), "nc-2".to_string());
        assert_ne!(mapper.fingerprint(&ns), before);
    }
}

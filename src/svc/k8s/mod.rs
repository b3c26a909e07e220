//! # Kubernetes module
//!
//! This module provide the reconcile skeleton shared by every controller,
//! the process context and the error taxonomy reconcilers translate to
//! requeue decisions

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use crate::svc::{
    cfg::Configuration,
    nsx::{
        self,
        client::Client,
        subnet::{BindingService, SubnetService},
        policy::PolicyService,
        vpc::{IpAllocationService, VpcService},
    },
    telemetry::metrics::CONTROLLER_SYNC_TOTAL,
};

pub mod binding;
pub mod client;
pub mod controller;
pub mod finalizer;
pub mod inventory;
pub mod lease;
pub mod namespace;
pub mod queue;
pub mod recorder;
pub mod resource;
pub mod shared;
pub mod status;
pub mod webhook;

// -----------------------------------------------------------------------------
// Constants

/// loop-level timeout after which a reconcile fails and requeues
pub const RECONCILE_TIMEOUT: Duration = Duration::from_secs(300);

/// fixed delay applied when a referenced object is not ready yet
pub const DEPENDENCY_REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// long delay applied on authentication failures, the user has to act first
pub const AUTH_REQUEUE_DELAY: Duration = Duration::from_secs(300);

// -----------------------------------------------------------------------------
// Request structure

/// one unit of work, the namespaced name of the resource to reconcile
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub struct Request {
    pub namespace: Option<String>,
    pub name: String,
}

impl Request {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn from_resource<T>(obj: &T) -> Self
    where
        T: ResourceExt,
    {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

// -----------------------------------------------------------------------------
// Outcome enumeration

/// requeue decision returned by a reconciler
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Outcome {
    /// the resource converged, forget its failure history
    Done,
    /// re-add the item after the given delay, bypassing the rate limiter
    RequeueAfter(Duration),
    /// re-add the item under the rate limiter's pacing
    Requeue,
}

// -----------------------------------------------------------------------------
// Kind enumeration

/// abstract failure kinds, the queue's rate limiter governs the pacing of
/// each of them
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Kind {
    TransientNetwork,
    StaleVersion,
    NotFound,
    Validation,
    Auth,
    DependencyUnready,
    Referenced,
    Fatal,
}

impl Kind {
    /// translate the failure kind to a requeue decision
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::NotFound | Self::Validation => Outcome::Done,
            Self::Auth => Outcome::RequeueAfter(AUTH_REQUEUE_DELAY),
            Self::DependencyUnready => Outcome::RequeueAfter(DEPENDENCY_REQUEUE_DELAY),
            Self::TransientNetwork | Self::StaleVersion | Self::Referenced | Self::Fatal => {
                Outcome::Requeue
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Classify trait

/// every reconciler error maps onto the taxonomy
pub trait Classify {
    fn kind(&self) -> Kind;
}

impl Classify for kube::Error {
    fn kind(&self) -> Kind {
        match self {
            kube::Error::Api(response) => match response.code {
                404 => Kind::NotFound,
                401 | 403 => Kind::Auth,
                409 | 412 => Kind::StaleVersion,
                408 | 429 => Kind::TransientNetwork,
                400 | 422 => Kind::Validation,
                500..=599 => Kind::TransientNetwork,
                _ => Kind::Fatal,
            },
            kube::Error::HyperError(_) | kube::Error::Service(_) => Kind::TransientNetwork,
            _ => Kind::Fatal,
        }
    }
}

impl Classify for nsx::Error {
    fn kind(&self) -> Kind {
        match nsx::Error::kind(self) {
            nsx::ErrorKind::Transient => Kind::TransientNetwork,
            nsx::ErrorKind::StaleRevision => Kind::StaleVersion,
            nsx::ErrorKind::NotFound => Kind::NotFound,
            nsx::ErrorKind::Auth => Kind::Auth,
            nsx::ErrorKind::InvalidRequest => Kind::Validation,
            nsx::ErrorKind::Fatal => Kind::Fatal,
        }
    }
}

// -----------------------------------------------------------------------------
// State structure

/// process context threaded through every component, there is no module
/// level mutable state besides the metrics registry
pub struct State {
    pub kube: kube::Client,
    pub nsx: Client,
    pub config: Arc<Configuration>,
    pub bindings: binding::Registry,
    pub shared_subnets: shared::ResourceMap,
    pub inventory: inventory::Batcher,
    pub vpcs: VpcService,
    pub subnets: SubnetService,
    pub policies: PolicyService,
    pub binding_maps: BindingService,
    pub allocations: IpAllocationService,
}

impl State {
    pub fn new(kube: kube::Client, nsx: Client, config: Arc<Configuration>) -> Arc<Self> {
        Arc::new(Self {
            kube,
            nsx: nsx.to_owned(),
            config,
            bindings: binding::Registry::new(),
            shared_subnets: shared::ResourceMap::new(),
            inventory: inventory::Batcher::new(),
            vpcs: VpcService::new(nsx.to_owned()),
            subnets: SubnetService::new(nsx.to_owned()),
            policies: PolicyService::new(nsx.to_owned()),
            binding_maps: BindingService::new(nsx.to_owned()),
            allocations: IpAllocationService::new(nsx),
        })
    }

    pub fn cluster(&self) -> &str {
        &self.config.cluster.name
    }
}

// -----------------------------------------------------------------------------
// Reconcile trait

/// per-type hooks of the shared reconcile skeleton, the driver owns fetch,
/// deletion check, finalizer, terminal validation and pacing
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    type Resource: Resource
        + ResourceExt
        + DeserializeOwned
        + serde::Serialize
        + Clone
        + Debug
        + Send
        + Sync;
    type Error: Classify + std::error::Error + Send + Sync;

    /// resource kind used by logs and metrics
    const KIND: &'static str;

    /// finalizer guarding the delete path, `None` when the controller does
    /// not own one
    const FINALIZER: Option<&'static str>;

    fn api(state: &State, namespace: Option<&str>) -> Api<Self::Resource>;

    /// spec validation, failures are terminal for this revision
    fn validate(&self, _obj: &Self::Resource) -> Result<(), String> {
        Ok(())
    }

    /// called when [`Reconcile::validate`] rejects the revision, implementers
    /// surface the message to the user
    async fn rejected(&self, _state: &Arc<State>, _obj: Arc<Self::Resource>, message: &str) {
        warn!(kind = Self::KIND, message = message, "Rejected resource revision");
    }

    /// converge the fabric towards the resource's desired state
    async fn apply(&self, state: &Arc<State>, obj: Arc<Self::Resource>) -> Result<Outcome, Self::Error>;

    /// tear down what the resource owns, the driver removes the finalizer
    /// once this returns `Done`
    async fn cleanup(&self, _state: &Arc<State>, _obj: Arc<Self::Resource>) -> Result<Outcome, Self::Error> {
        Ok(Outcome::Done)
    }

    /// the resource is gone entirely, remove owned fabric objects recorded
    /// in the store for its namespaced name
    async fn cleanup_absent(&self, _state: &Arc<State>, _request: &Request) -> Result<(), Self::Error> {
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// process function

/// one pass of the reconcile skeleton for one resource instance
pub async fn process<R>(reconciler: &R, state: &Arc<State>, request: &Request) -> Outcome
where
    R: Reconcile,
    <R::Resource as Resource>::DynamicType: Default,
{
    CONTROLLER_SYNC_TOTAL.with_label_values(&[R::KIND]).inc();

    match tokio::time::timeout(RECONCILE_TIMEOUT, execute(reconciler, state, request)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(
                kind = R::KIND,
                name = &request.name,
                "Reconciliation did not complete within {}s, requeue",
                RECONCILE_TIMEOUT.as_secs()
            );

            Outcome::Requeue
        }
    }
}

async fn execute<R>(reconciler: &R, state: &Arc<State>, request: &Request) -> Outcome
where
    R: Reconcile,
    <R::Resource as Resource>::DynamicType: Default,
{
    let api = R::api(state, request.namespace.as_deref());

    let obj = match api.get_opt(&request.name).await {
        Ok(obj) => obj,
        Err(err) => {
            warn!(
                kind = R::KIND,
                name = &request.name,
                error = err.to_string(),
                "Failed to fetch resource"
            );

            return err.kind().outcome();
        }
    };

    let Some(obj) = obj else {
        // gone entirely, sweep what the store still records for it
        return match reconciler.cleanup_absent(state, request).await {
            Ok(()) => Outcome::Done,
            Err(err) => {
                error!(
                    kind = R::KIND,
                    name = &request.name,
                    error = err.to_string(),
                    "Failed to clean up after deleted resource"
                );

                err.kind().outcome()
            }
        };
    };

    let obj = Arc::new(obj);

    if resource::deleted(obj.as_ref()) {
        info!(
            kind = R::KIND,
            namespace = request.namespace.as_deref().unwrap_or("<none>"),
            name = &request.name,
            "Received deletion event for resource",
        );

        return match reconciler.cleanup(state, obj.to_owned()).await {
            Ok(Outcome::Done) => {
                if let Some(name) = R::FINALIZER {
                    if let Err(err) = finalizer::release(&api, obj.as_ref(), name).await {
                        return err.kind().outcome();
                    }
                }

                Outcome::Done
            }
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    kind = R::KIND,
                    name = &request.name,
                    error = err.to_string(),
                    "Failed to delete resource"
                );

                err.kind().outcome()
            }
        };
    }

    if let Some(name) = R::FINALIZER {
        match finalizer::ensure(&api, obj.as_ref(), name).await {
            // the patch triggers the next iteration
            Ok(true) => return Outcome::Requeue,
            Ok(false) => {}
            Err(err) => return err.kind().outcome(),
        }
    }

    if let Err(message) = reconciler.validate(obj.as_ref()) {
        reconciler.rejected(state, obj.to_owned(), &message).await;
        // terminal until the spec changes
        return Outcome::Done;
    }

    match reconciler.apply(state, obj).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(
                kind = R::KIND,
                name = &request.name,
                error = err.to_string(),
                "Failed to reconcile resource"
            );

            err.kind().outcome()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_should_map_to_requeue_decisions() {
        assert_eq!(Kind::NotFound.outcome(), Outcome::Done);
        assert_eq!(Kind::Validation.outcome(), Outcome::Done);
        assert_eq!(Kind::TransientNetwork.outcome(), Outcome::Requeue);
        assert_eq!(Kind::StaleVersion.outcome(), Outcome::Requeue);
        assert_eq!(Kind::Referenced.outcome(), Outcome::Requeue);
        assert_eq!(Kind::Fatal.outcome(), Outcome::Requeue);
        assert_eq!(
            Kind::DependencyUnready.outcome(),
            Outcome::RequeueAfter(DEPENDENCY_REQUEUE_DELAY)
        );
        assert_eq!(Kind::Auth.outcome(), Outcome::RequeueAfter(AUTH_REQUEUE_DELAY));
    }

    #[test]
    fn kubernetes_errors_should_classify_by_status_code() {
        let api_error = |code: u16| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: String::new(),
                reason: String::new(),
                code,
            })
        };

        assert_eq!(api_error(404).kind(), Kind::NotFound);
        assert_eq!(api_error(403).kind(), Kind::Auth);
        assert_eq!(api_error(409).kind(), Kind::StaleVersion);
        assert_eq!(api_error(429).kind(), Kind::TransientNetwork);
        assert_eq!(api_error(503).kind(), Kind::TransientNetwork);
        assert_eq!(api_error(422).kind(), Kind::Validation);
    }
}

//! # Garbage collector module
//!
//! This module provide the three-phase cleanup driver sweeping fabric
//! objects whose custom resource is gone

use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::svc::nsx::{
    client::Client,
    model::Tag,
    tag::{self, SCOPE_CREATED_FOR, SCOPE_CR_UID},
    Error,
};

// -----------------------------------------------------------------------------
// Phase enumeration

/// cleanup functions run in phase order, no infra delete runs while a
/// vpc-children delete for the same vpc is in flight
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum Phase {
    /// cluster-scoped objects that would block vpc teardown
    PreVpc,
    /// children of owned vpcs, in dependency order
    VpcChildren,
    /// the vpcs themselves and remaining cluster-scoped owned objects
    Infra,
}

impl Phase {
    pub const ORDER: [Phase; 3] = [Phase::PreVpc, Phase::VpcChildren, Phase::Infra];
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::PreVpc => write!(f, "pre-vpc"),
            Self::VpcChildren => write!(f, "vpc-children"),
            Self::Infra => write!(f, "infra"),
        }
    }
}

// -----------------------------------------------------------------------------
// LiveSet structure

/// the set of custom resource uids alive on the cluster, keyed by the
/// `created_for` purpose the fabric objects were tagged with
#[derive(Clone, Debug, Default)]
pub struct LiveSet {
    inner: HashMap<String, HashSet<String>>,
}

impl LiveSet {
    pub fn insert(&mut self, created_for: &str, uid: &str) {
        self.inner
            .entry(created_for.to_string())
            .or_default()
            .insert(uid.to_string());
    }

    pub fn contains(&self, created_for: &str, uid: &str) -> bool {
        self.inner
            .get(created_for)
            .is_some_and(|uids| uids.contains(uid))
    }

    /// returns if the tag set marks an owned object whose custom resource no
    /// longer exists, objects without this cluster's marker are never
    /// collected
    pub fn orphaned(&self, cluster: &str, tags: &[Tag]) -> bool {
        if !tag::owned_by(tags, cluster) {
            return false;
        }

        let created_for = tag::find(tags, SCOPE_CREATED_FOR).unwrap_or_default();
        match tag::find(tags, SCOPE_CR_UID) {
            None => true,
            Some(uid) => !self.contains(created_for, uid),
        }
    }
}

// -----------------------------------------------------------------------------
// CleanupContext structure

pub struct CleanupContext {
    pub nsx: Client,
    pub cluster: String,
    pub live: LiveSet,
}

// -----------------------------------------------------------------------------
// Cleanup trait

/// one cleanup function of one fabric subsystem, registered against a phase
#[async_trait]
pub trait Cleanup: Send + Sync {
    fn name(&self) -> &'static str;

    fn phase(&self) -> Phase;

    async fn clean(&self, ctx: &CleanupContext) -> Result<(), Error>;
}

// -----------------------------------------------------------------------------
// AggregateError structure

#[derive(Debug)]
pub struct AggregateError {
    pub failures: Vec<(String, Error)>,
}

impl Display for AggregateError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "failed to execute {} cleanup task(s)", self.failures.len())?;
        for (name, err) in &self.failures {
            write!(f, ", {name}: {err}")?;
        }

        Ok(())
    }
}

impl std::error::Error for AggregateError {}

// -----------------------------------------------------------------------------
// Collector structure

#[derive(Default)]
pub struct Collector {
    cleanups: Vec<Arc<dyn Cleanup>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, cleanup: Arc<dyn Cleanup>) -> &mut Self {
        self.cleanups.push(cleanup);
        self
    }

    /// run every registered cleanup, phase by phase, a failing task does not
    /// stop the remaining ones but is reported in the aggregate
    pub async fn collect(&self, ctx: &CleanupContext) -> Result<(), AggregateError> {
        let mut failures = vec![];

        for phase in Phase::ORDER {
            for cleanup in self.cleanups.iter().filter(|c| c.phase() == phase) {
                debug!(phase = phase.to_string(), task = cleanup.name(), "Execute cleanup task");
                if let Err(err) = cleanup.clean(ctx).await {
                    warn!(
                        phase = phase.to_string(),
                        task = cleanup.name(),
                        error = err.to_string(),
                        "Failed to execute cleanup task"
                    );

                    failures.push((cleanup.name().to_string(), err));
                }
            }
        }

        if !failures.is_empty() {
            return Err(AggregateError { failures });
        }

        info!(cluster = &ctx.cluster, "Garbage collection completed without error");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::svc::nsx::{client::tests::Script, tag::ownership};

    struct Recorder {
        name: &'static str,
        phase: Phase,
        order: Arc<AtomicUsize>,
        seen_at: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Cleanup for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn phase(&self) -> Phase {
            self.phase
        }

        async fn clean(&self, _ctx: &CleanupContext) -> Result<(), Error> {
            self.seen_at
                .store(self.order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);

            if self.fail {
                return Err(Error::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }

            Ok(())
        }
    }

    fn ctx() -> CleanupContext {
        CleanupContext {
            nsx: Client::new(
                Script::new(vec![]),
                vec!["mgr-1".to_string()],
                "admin",
                "password",
                "cluster-1",
            )
            .expect("client to build"),
            cluster: "cluster-1".to_string(),
            live: LiveSet::default(),
        }
    }

    #[tokio::test]
    async fn phases_should_run_in_order_and_failures_should_aggregate() {
        let order = Arc::new(AtomicUsize::new(0));
        let infra = Arc::new(Recorder {
            name: "infra",
            phase: Phase::Infra,
            order: order.to_owned(),
            seen_at: AtomicUsize::new(0),
            fail: false,
        });
        let children = Arc::new(Recorder {
            name: "children",
            phase: Phase::VpcChildren,
            order: order.to_owned(),
            seen_at: AtomicUsize::new(0),
            fail: true,
        });
        let pre = Arc::new(Recorder {
            name: "pre",
            phase: Phase::PreVpc,
            order,
            seen_at: AtomicUsize::new(0),
            fail: false,
        });

        let mut collector = Collector::new();
        collector
            .register(infra.to_owned())
            .register(pre.to_owned())
            .register(children.to_owned());

        let err = collector
            .collect(&ctx())
            .await
            .expect_err("aggregate to be reported");

        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].0, "children");
        // registration order does not matter, phase order does
        assert!(pre.seen_at.load(Ordering::SeqCst) < children.seen_at.load(Ordering::SeqCst));
        assert!(children.seen_at.load(Ordering::SeqCst) < infra.seen_at.load(Ordering::SeqCst));
    }

    #[test]
    fn orphans_should_require_this_clusters_marker() {
        let mut live = LiveSet::default();
        live.insert("subnet", "uid-1");

        let owned_live = ownership("cluster-1", Some("ns-a"), "s1", "uid-1", "subnet");
        let owned_gone = ownership("cluster-1", Some("ns-a"), "s2", "uid-2", "subnet");
        let foreign = ownership("cluster-2", Some("ns-a"), "s3", "uid-3", "subnet");

        assert!(!live.orphaned("cluster-1", &owned_live));
        assert!(live.orphaned("cluster-1", &owned_gone));
        assert!(!live.orphaned("cluster-1", &foreign));
    }
}

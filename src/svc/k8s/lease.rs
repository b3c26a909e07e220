//! # Lease module
//!
//! This module provide coordination/v1 lease based leader election, exactly
//! one operator instance is active while the others block until promoted

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{ObjectMeta, Patch, PatchParams, PostParams},
    Api,
};
use tracing::{debug, info, warn};

// -----------------------------------------------------------------------------
// Constants

pub const LEASE_DURATION: Duration = Duration::from_secs(15);
pub const RETRY_PERIOD: Duration = Duration::from_secs(2);

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("lost leadership of lease '{0}'")]
    Lost(String),
}

// -----------------------------------------------------------------------------
// Elector structure

pub struct Elector {
    api: Api<Lease>,
    name: String,
    identity: String,
}

impl Elector {
    pub fn new(kube: kube::Client, namespace: &str, name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(kube, namespace),
            name: name.to_string(),
            identity: identity.to_string(),
        }
    }

    fn desired(&self) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.to_owned()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.to_owned()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(Utc::now())),
                renew_time: Some(MicroTime(Utc::now())),
                ..Default::default()
            }),
        }
    }

    fn held_by_live_other(&self, lease: &Lease) -> bool {
        let Some(spec) = &lease.spec else {
            return false;
        };

        let holder = spec.holder_identity.as_deref().unwrap_or_default();
        if holder.is_empty() || holder == self.identity {
            return false;
        }

        let duration = spec
            .lease_duration_seconds
            .map(|seconds| chrono::Duration::seconds(i64::from(seconds)))
            .unwrap_or_else(|| {
                chrono::Duration::seconds(LEASE_DURATION.as_secs() as i64)
            });

        spec.renew_time
            .as_ref()
            .is_some_and(|renew| renew.0 + duration > Utc::now())
    }

    /// block until this instance holds the lease
    pub async fn acquire(&self) -> Result<(), Error> {
        loop {
            match self.api.get_opt(&self.name).await.map_err(Error::KubeClient)? {
                None => {
                    match self.api.create(&PostParams::default(), &self.desired()).await {
                        Ok(_) => {
                            info!(lease = &self.name, identity = &self.identity, "Acquired lease");
                            return Ok(());
                        }
                        // somebody else won the race, retry
                        Err(kube::Error::Api(response)) if response.code == 409 => {}
                        Err(err) => return Err(Error::KubeClient(err)),
                    }
                }
                Some(lease) if self.held_by_live_other(&lease) => {
                    debug!(lease = &self.name, "Lease held by a live instance, blocking");
                }
                Some(_) => {
                    // expired or already ours, take it over
                    match self
                        .api
                        .patch(
                            &self.name,
                            &PatchParams::default(),
                            &Patch::Merge(&self.desired()),
                        )
                        .await
                    {
                        Ok(_) => {
                            info!(lease = &self.name, identity = &self.identity, "Acquired lease");
                            return Ok(());
                        }
                        Err(kube::Error::Api(response)) if response.code == 409 => {}
                        Err(err) => return Err(Error::KubeClient(err)),
                    }
                }
            }

            tokio::time::sleep(RETRY_PERIOD).await;
        }
    }

    /// renew the lease forever, erroring out when leadership is lost so the
    /// caller can abort the process
    pub async fn keep(&self) -> Result<(), Error> {
        let period = LEASE_DURATION / 3;

        loop {
            tokio::time::sleep(period).await;

            let lease = self
                .api
                .get_opt(&self.name)
                .await
                .map_err(Error::KubeClient)?;

            if lease.as_ref().is_some_and(|lease| self.held_by_live_other(lease)) {
                warn!(lease = &self.name, "Another instance took the lease over");
                return Err(Error::Lost(self.name.to_owned()));
            }

            self.api
                .patch(
                    &self.name,
                    &PatchParams::default(),
                    &Patch::Merge(&self.desired()),
                )
                .await
                .map_err(Error::KubeClient)?;

            debug!(lease = &self.name, "Renewed lease");
        }
    }
}

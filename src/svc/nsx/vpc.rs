//! # Vpc module
//!
//! This module provide the fabric-side crud operations for vpcs and the
//! cluster-scoped cleanups surrounding them

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::svc::nsx::{
    client::{Client, POLICY_BASE},
    gc::{Cleanup, CleanupContext, Phase},
    model::{IpAddressAllocation, Tag, Vpc},
    path::VpcPath,
    query::TagQuery,
    store::{Identified, IndexFn, Store, BY_CR_UID, BY_NAMESPACE},
    tag::{find, SCOPE_CLUSTER, SCOPE_CR_UID, SCOPE_NAMESPACE},
    Error,
};

// -----------------------------------------------------------------------------
// Indexers

fn by_namespace(vpc: &Vpc) -> Vec<String> {
    find(&vpc.tags, SCOPE_NAMESPACE)
        .map(|ns| vec![ns.to_string()])
        .unwrap_or_default()
}

fn by_cr_uid(vpc: &Vpc) -> Vec<String> {
    find(&vpc.tags, SCOPE_CR_UID)
        .map(|uid| vec![uid.to_string()])
        .unwrap_or_default()
}

pub fn indexers() -> Vec<(&'static str, IndexFn<Vpc>)> {
    vec![(BY_NAMESPACE, by_namespace), (BY_CR_UID, by_cr_uid)]
}

// -----------------------------------------------------------------------------
// VpcService structure

#[derive(Clone)]
pub struct VpcService {
    pub client: Client,
    pub store: Arc<Store<Vpc>>,
}

impl VpcService {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            store: Arc::new(Store::new(&indexers())),
        }
    }

    pub async fn populate(&self) -> Result<(), Error> {
        let vpcs: Vec<Vpc> = self
            .client
            .query_by_tags(&TagQuery::new(Vpc::RESOURCE_TYPE).tagged(SCOPE_CLUSTER, self.client.cluster()))
            .await?;

        info!(count = vpcs.len(), "Populate vpc store from the fabric");
        for vpc in vpcs {
            self.store.update(vpc);
        }

        self.store.done_synced();
        Ok(())
    }

    /// create or replace the vpc under the given project, the realized
    /// object is mirrored into the store
    pub async fn apply(&self, org: &str, project: &str, mut vpc: Vpc) -> Result<Vpc, Error> {
        let path = format!("/orgs/{org}/projects/{project}/vpcs/{}", vpc.id);
        vpc.path = Some(path.to_owned());

        debug!(path = &path, "Apply vpc on the fabric");
        let realized: Vpc = self.client.put(&format!("{POLICY_BASE}{path}"), &vpc).await?;

        self.store.update(realized.to_owned());
        Ok(realized)
    }

    /// fetch the vpc at the given path, consulting the store first
    pub async fn get(&self, path: &VpcPath) -> Result<Option<Arc<Vpc>>, Error> {
        if let Some(vpc) = self.store.get(&path.to_string()) {
            return Ok(Some(vpc));
        }

        let Some(vpc) = self
            .client
            .get_opt::<Vpc>(&format!("{POLICY_BASE}{path}"))
            .await?
        else {
            return Ok(None);
        };

        self.store.update(vpc.to_owned());
        Ok(Some(Arc::new(vpc)))
    }

    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        debug!(path = path, "Delete vpc on the fabric");
        self.client.delete(&format!("{POLICY_BASE}{path}")).await?;
        self.store.delete(path);

        Ok(())
    }

    /// returns the owned vpc recorded for the given namespace
    pub fn by_namespace(&self, namespace: &str) -> Option<Arc<Vpc>> {
        self.store.by_index(BY_NAMESPACE, namespace).into_iter().next()
    }
}

// -----------------------------------------------------------------------------
// IpAllocationService structure

fn allocation_by_cr_uid(allocation: &IpAddressAllocation) -> Vec<String> {
    find(&allocation.tags, SCOPE_CR_UID)
        .map(|uid| vec![uid.to_string()])
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct IpAllocationService {
    pub client: Client,
    pub store: Arc<Store<IpAddressAllocation>>,
}

impl IpAllocationService {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            store: Arc::new(Store::new(&[(
                BY_CR_UID,
                allocation_by_cr_uid as IndexFn<IpAddressAllocation>,
            )])),
        }
    }

    pub async fn populate(&self) -> Result<(), Error> {
        let allocations: Vec<IpAddressAllocation> = self
            .client
            .query_by_tags(
                &TagQuery::new(IpAddressAllocation::RESOURCE_TYPE)
                    .tagged(SCOPE_CLUSTER, self.client.cluster()),
            )
            .await?;

        info!(count = allocations.len(), "Populate ip allocation store from the fabric");
        for allocation in allocations {
            self.store.update(allocation);
        }

        self.store.done_synced();
        Ok(())
    }

    /// allocate or refresh the allocation under the given vpc, the realized
    /// object carries the allocated addresses
    pub async fn apply(
        &self,
        vpc: &VpcPath,
        mut allocation: IpAddressAllocation,
    ) -> Result<IpAddressAllocation, Error> {
        let path = format!("{vpc}/ip-address-allocations/{}", allocation.id);
        allocation.path = Some(path.to_owned());

        debug!(path = &path, "Apply ip address allocation on the fabric");
        let realized: IpAddressAllocation = self
            .client
            .put(&format!("{POLICY_BASE}{path}"), &allocation)
            .await?;

        self.store.update(realized.to_owned());
        Ok(realized)
    }

    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        debug!(path = path, "Delete ip address allocation on the fabric");
        self.client.delete(&format!("{POLICY_BASE}{path}")).await?;
        self.store.delete(path);

        Ok(())
    }

    pub fn by_cr_uid(&self, uid: &str) -> Vec<Arc<IpAddressAllocation>> {
        self.store.by_index(BY_CR_UID, uid)
    }
}

// -----------------------------------------------------------------------------
// IpAllocationCleanup structure

pub struct IpAllocationCleanup {
    pub service: IpAllocationService,
}

#[async_trait]
impl Cleanup for IpAllocationCleanup {
    fn name(&self) -> &'static str {
        "ip-address-allocations"
    }

    fn phase(&self) -> Phase {
        Phase::VpcChildren
    }

    async fn clean(&self, ctx: &CleanupContext) -> Result<(), Error> {
        let allocations: Vec<IpAddressAllocation> = ctx
            .nsx
            .query_by_tags(
                &TagQuery::new(IpAddressAllocation::RESOURCE_TYPE).tagged(SCOPE_CLUSTER, &ctx.cluster),
            )
            .await?;

        for allocation in allocations {
            if ctx.live.orphaned(&ctx.cluster, &allocation.tags) {
                info!(path = allocation.id(), "Collect orphaned ip address allocation");
                self.service
                    .delete(allocation.path.as_deref().unwrap_or(&allocation.id))
                    .await?;
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// VpcCleanup structure

pub struct VpcCleanup {
    pub service: VpcService,
}

#[async_trait]
impl Cleanup for VpcCleanup {
    fn name(&self) -> &'static str {
        "vpcs"
    }

    fn phase(&self) -> Phase {
        Phase::Infra
    }

    async fn clean(&self, ctx: &CleanupContext) -> Result<(), Error> {
        let vpcs: Vec<Vpc> = ctx
            .nsx
            .query_by_tags(&TagQuery::new(Vpc::RESOURCE_TYPE).tagged(SCOPE_CLUSTER, &ctx.cluster))
            .await?;

        for vpc in vpcs {
            if ctx.live.orphaned(&ctx.cluster, &vpc.tags) {
                info!(path = vpc.id(), "Collect orphaned vpc");
                self.service.delete(vpc.path.as_deref().unwrap_or(&vpc.id)).await?;
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// DlbCleanup structure

/// distributed load-balancer resources block vpc teardown and are collected
/// before any vpc child
pub struct DlbCleanup {
    pub client: Client,
}

#[derive(Deserialize, Debug)]
struct LbService {
    #[serde(rename = "path")]
    path: String,
    #[serde(rename = "tags", default)]
    tags: Vec<Tag>,
}

#[async_trait]
impl Cleanup for DlbCleanup {
    fn name(&self) -> &'static str {
        "distributed-load-balancers"
    }

    fn phase(&self) -> Phase {
        Phase::PreVpc
    }

    async fn clean(&self, ctx: &CleanupContext) -> Result<(), Error> {
        let services: Vec<LbService> = ctx
            .nsx
            .query_by_tags(&TagQuery::new("LBService").tagged(SCOPE_CLUSTER, &ctx.cluster))
            .await?;

        for service in services {
            if ctx.live.orphaned(&ctx.cluster, &service.tags) {
                info!(path = &service.path, "Collect orphaned distributed load balancer");
                self.client.delete(&format!("{POLICY_BASE}{}", service.path)).await?;
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// InventoryCleanup structure

/// the container-cluster inventory entry is removed before vpc teardown so
/// the fabric ui stops advertising the cluster
pub struct InventoryCleanup {
    pub client: Client,
}

#[async_trait]
impl Cleanup for InventoryCleanup {
    fn name(&self) -> &'static str {
        "inventory"
    }

    fn phase(&self) -> Phase {
        Phase::PreVpc
    }

    async fn clean(&self, ctx: &CleanupContext) -> Result<(), Error> {
        info!(cluster = &ctx.cluster, "Remove container cluster inventory entry");
        self.client
            .delete(&format!("/api/v1/fabric/container-clusters/{}", ctx.cluster))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::nsx::{client::tests::Script, tag::ownership};

    #[tokio::test]
    async fn get_should_fall_back_to_the_api_and_mirror() {
        let script = Script::new(vec![(
            200,
            r#"{"id":"v","display_name":"v","path":"/orgs/default/projects/p/vpcs/v","tags":[{"scope":"nsx-op/cluster","tag":"cluster-1"},{"scope":"nsx-op/namespace","tag":"ns-a"}]}"#,
        )]);
        let service = VpcService::new(
            Client::new(script, vec!["mgr-1".to_string()], "admin", "password", "cluster-1")
                .expect("client to build"),
        );

        let path: VpcPath = "/orgs/default/projects/p/vpcs/v".parse().expect("path to parse");
        let vpc = service
            .get(&path)
            .await
            .expect("lookup to succeed")
            .expect("vpc to be found");

        assert_eq!(vpc.id, "v");
        assert!(service.by_namespace("ns-a").is_some());
    }

    #[tokio::test]
    async fn infra_cleanup_should_delete_orphaned_vpcs() {
        let vpc = Vpc {
            id: "v1".to_string(),
            path: Some("/orgs/default/projects/p/vpcs/v1".to_string()),
            display_name: "v1".to_string(),
            tags: ownership("cluster-1", Some("ns-gone"), "ns-gone", "uid-gone", "vpc"),
            ..Default::default()
        };
        let body = format!(
            r#"{{"results":[{}],"cursor":"1","result_count":1}}"#,
            serde_json::to_string(&vpc).expect("vpc to serialize")
        );
        let script = Script::new(vec![(200, body.as_str()), (200, "{}")]);
        let service = VpcService::new(
            Client::new(
                script.to_owned(),
                vec!["mgr-1".to_string()],
                "admin",
                "password",
                "cluster-1",
            )
            .expect("client to build"),
        );

        let ctx = CleanupContext {
            nsx: service.client.to_owned(),
            cluster: "cluster-1".to_string(),
            live: crate::svc::nsx::gc::LiveSet::default(),
        };

        VpcCleanup { service }.clean(&ctx).await.expect("cleanup to succeed");

        let seen = script.seen.lock().expect("seen mutex to be healthy").to_owned();
        assert!(seen
            .iter()
            .any(|(method, uri)| method == "DELETE" && uri.ends_with("/vpcs/v1")));
    }
}

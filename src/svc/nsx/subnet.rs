//! # Subnet module
//!
//! This module provide the fabric-side crud operations for vpc subnets,
//! subnet ports and subnet connection binding maps

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::svc::nsx::{
    client::{Client, POLICY_BASE},
    gc::{Cleanup, CleanupContext, Phase},
    model::{SubnetConnectionBindingMap, VpcSubnet, VpcSubnetPort},
    path::{AssociatedKey, ResourcePath, VpcPath, DEFAULT_ORG},
    query::TagQuery,
    store::{
        Identified, IndexFn, Store, BY_ASSOCIATED_RESOURCE, BY_CR_NAME, BY_CR_UID, BY_NAMESPACE,
        BY_VPC,
    },
    tag::{find, SCOPE_CLUSTER, SCOPE_CR_NAME, SCOPE_CR_UID, SCOPE_NAMESPACE},
    Error,
};

// -----------------------------------------------------------------------------
// Indexers

fn by_namespace(subnet: &VpcSubnet) -> Vec<String> {
    find(&subnet.tags, SCOPE_NAMESPACE)
        .map(|ns| vec![ns.to_string()])
        .unwrap_or_default()
}

fn by_cr_name(subnet: &VpcSubnet) -> Vec<String> {
    match (find(&subnet.tags, SCOPE_NAMESPACE), find(&subnet.tags, SCOPE_CR_NAME)) {
        (Some(namespace), Some(name)) => vec![format!("{namespace}/{name}")],
        _ => vec![],
    }
}

fn by_cr_uid(subnet: &VpcSubnet) -> Vec<String> {
    find(&subnet.tags, SCOPE_CR_UID)
        .map(|uid| vec![uid.to_string()])
        .unwrap_or_default()
}

fn by_associated_resource(subnet: &VpcSubnet) -> Vec<String> {
    subnet
        .path
        .as_deref()
        .and_then(|path| path.parse::<ResourcePath>().ok())
        .map(|path| vec![AssociatedKey::from(&path).to_string()])
        .unwrap_or_default()
}

fn by_vpc(subnet: &VpcSubnet) -> Vec<String> {
    subnet
        .parent_path
        .as_deref()
        .map(|parent| vec![parent.to_string()])
        .unwrap_or_default()
}

pub fn indexers() -> Vec<(&'static str, IndexFn<VpcSubnet>)> {
    vec![
        (BY_NAMESPACE, by_namespace),
        (BY_CR_NAME, by_cr_name),
        (BY_CR_UID, by_cr_uid),
        (BY_ASSOCIATED_RESOURCE, by_associated_resource),
        (BY_VPC, by_vpc),
    ]
}

// -----------------------------------------------------------------------------
// SubnetService structure

#[derive(Clone)]
pub struct SubnetService {
    pub client: Client,
    pub store: Arc<Store<VpcSubnet>>,
}

impl SubnetService {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            store: Arc::new(Store::new(&indexers())),
        }
    }

    /// mirror every subnet bearing this cluster's marker into the store and
    /// flip the sync flag
    pub async fn populate(&self) -> Result<(), Error> {
        let subnets: Vec<VpcSubnet> = self
            .client
            .query_by_tags(
                &TagQuery::new(VpcSubnet::RESOURCE_TYPE).tagged(SCOPE_CLUSTER, self.client.cluster()),
            )
            .await?;

        info!(count = subnets.len(), "Populate subnet store from the fabric");
        for subnet in subnets {
            self.store.update(subnet);
        }

        self.store.done_synced();
        Ok(())
    }

    /// create or replace the subnet under the given vpc, the realized object
    /// is mirrored into the store
    pub async fn apply(&self, vpc: &VpcPath, mut subnet: VpcSubnet) -> Result<VpcSubnet, Error> {
        let path = format!("{vpc}/subnets/{}", subnet.id);
        subnet.path = Some(path.to_owned());

        debug!(path = &path, "Apply subnet on the fabric");
        let realized: VpcSubnet = self
            .client
            .put(&format!("{POLICY_BASE}{path}"), &subnet)
            .await?;

        self.store.update(realized.to_owned());
        Ok(realized)
    }

    /// delete the subnet at the given path, absent objects are a success
    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        debug!(path = path, "Delete subnet on the fabric");
        self.client.delete(&format!("{POLICY_BASE}{path}")).await?;
        self.store.delete(path);

        Ok(())
    }

    /// fetch a fabric subnet by its associated-resource key, consulting the
    /// store first and falling back to the api on cache miss
    pub async fn get_by_associated(&self, key: &AssociatedKey) -> Result<Option<Arc<VpcSubnet>>, Error> {
        if let Some(subnet) = self
            .store
            .by_index(BY_ASSOCIATED_RESOURCE, &key.to_string())
            .into_iter()
            .next()
        {
            return Ok(Some(subnet));
        }

        let path = ResourcePath::subnet(DEFAULT_ORG, &key.project, &key.vpc, &key.resource);
        let Some(subnet) = self
            .client
            .get_opt::<VpcSubnet>(&format!("{POLICY_BASE}{path}"))
            .await?
        else {
            return Ok(None);
        };

        self.store.update(subnet.to_owned());
        Ok(Some(Arc::new(subnet)))
    }

    /// returns the owned subnets recorded for the given custom resource uid
    pub fn by_cr_uid(&self, uid: &str) -> Vec<Arc<VpcSubnet>> {
        self.store.by_index(BY_CR_UID, uid)
    }

    /// returns the owned subnets recorded for the given namespaced name
    pub fn by_cr_name(&self, namespace: &str, name: &str) -> Vec<Arc<VpcSubnet>> {
        self.store.by_index(BY_CR_NAME, &format!("{namespace}/{name}"))
    }
}

// -----------------------------------------------------------------------------
// BindingService structure

fn binding_by_cr_uid(binding: &SubnetConnectionBindingMap) -> Vec<String> {
    find(&binding.tags, SCOPE_CR_UID)
        .map(|uid| vec![uid.to_string()])
        .unwrap_or_default()
}

fn binding_by_namespace(binding: &SubnetConnectionBindingMap) -> Vec<String> {
    find(&binding.tags, SCOPE_NAMESPACE)
        .map(|ns| vec![ns.to_string()])
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct BindingService {
    pub client: Client,
    pub store: Arc<Store<SubnetConnectionBindingMap>>,
}

impl BindingService {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            store: Arc::new(Store::new(&[
                (BY_CR_UID, binding_by_cr_uid as IndexFn<SubnetConnectionBindingMap>),
                (BY_NAMESPACE, binding_by_namespace),
            ])),
        }
    }

    pub async fn populate(&self) -> Result<(), Error> {
        let bindings: Vec<SubnetConnectionBindingMap> = self
            .client
            .query_by_tags(
                &TagQuery::new(SubnetConnectionBindingMap::RESOURCE_TYPE)
                    .tagged(SCOPE_CLUSTER, self.client.cluster()),
            )
            .await?;

        info!(count = bindings.len(), "Populate binding map store from the fabric");
        for binding in bindings {
            self.store.update(binding);
        }

        self.store.done_synced();
        Ok(())
    }

    /// create or replace the binding map as a child of the given subnet
    pub async fn apply(
        &self,
        parent_subnet_path: &str,
        mut binding: SubnetConnectionBindingMap,
    ) -> Result<SubnetConnectionBindingMap, Error> {
        let path = format!("{parent_subnet_path}/subnet-connection-binding-maps/{}", binding.id);
        binding.path = Some(path.to_owned());
        binding.parent_path = Some(parent_subnet_path.to_string());

        debug!(path = &path, "Apply subnet connection binding map on the fabric");
        let realized: SubnetConnectionBindingMap = self
            .client
            .put(&format!("{POLICY_BASE}{path}"), &binding)
            .await?;

        self.store.update(realized.to_owned());
        Ok(realized)
    }

    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        debug!(path = path, "Delete subnet connection binding map on the fabric");
        self.client.delete(&format!("{POLICY_BASE}{path}")).await?;
        self.store.delete(path);

        Ok(())
    }

    pub fn by_cr_uid(&self, uid: &str) -> Vec<Arc<SubnetConnectionBindingMap>> {
        self.store.by_index(BY_CR_UID, uid)
    }
}

// -----------------------------------------------------------------------------
// SubnetCleanup structure

pub struct SubnetCleanup {
    pub service: SubnetService,
}

#[async_trait]
impl Cleanup for SubnetCleanup {
    fn name(&self) -> &'static str {
        "subnets"
    }

    fn phase(&self) -> Phase {
        Phase::VpcChildren
    }

    async fn clean(&self, ctx: &CleanupContext) -> Result<(), Error> {
        let subnets: Vec<VpcSubnet> = ctx
            .nsx
            .query_by_tags(&TagQuery::new(VpcSubnet::RESOURCE_TYPE).tagged(SCOPE_CLUSTER, &ctx.cluster))
            .await?;

        for subnet in subnets {
            if ctx.live.orphaned(&ctx.cluster, &subnet.tags) {
                info!(path = subnet.id(), "Collect orphaned subnet");
                self.service
                    .delete(subnet.path.as_deref().unwrap_or(&subnet.id))
                    .await?;
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// PortCleanup structure

pub struct PortCleanup {
    pub client: Client,
}

#[async_trait]
impl Cleanup for PortCleanup {
    fn name(&self) -> &'static str {
        "subnet-ports"
    }

    fn phase(&self) -> Phase {
        Phase::VpcChildren
    }

    async fn clean(&self, ctx: &CleanupContext) -> Result<(), Error> {
        let ports: Vec<VpcSubnetPort> = ctx
            .nsx
            .query_by_tags(
                &TagQuery::new(VpcSubnetPort::RESOURCE_TYPE).tagged(SCOPE_CLUSTER, &ctx.cluster),
            )
            .await?;

        for port in ports {
            if ctx.live.orphaned(&ctx.cluster, &port.tags) {
                info!(path = port.id(), "Collect orphaned subnet port");
                self.client.delete(&format!("{POLICY_BASE}{}", port.id())).await?;
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// BindingCleanup structure

pub struct BindingCleanup {
    pub client: Client,
}

#[async_trait]
impl Cleanup for BindingCleanup {
    fn name(&self) -> &'static str {
        "subnet-connection-binding-maps"
    }

    fn phase(&self) -> Phase {
        Phase::VpcChildren
    }

    async fn clean(&self, ctx: &CleanupContext) -> Result<(), Error> {
        let bindings: Vec<SubnetConnectionBindingMap> = ctx
            .nsx
            .query_by_tags(
                &TagQuery::new(SubnetConnectionBindingMap::RESOURCE_TYPE)
                    .tagged(SCOPE_CLUSTER, &ctx.cluster),
            )
            .await?;

        for binding in bindings {
            if ctx.live.orphaned(&ctx.cluster, &binding.tags) {
                info!(path = binding.id(), "Collect orphaned subnet connection binding map");
                self.client
                    .delete(&format!("{POLICY_BASE}{}", binding.id()))
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::nsx::{client::tests::Script, tag::ownership};

    fn subnet(id: &str, namespace: &str, name: &str, uid: &str) -> VpcSubnet {
        VpcSubnet {
            id: id.to_string(),
            path: Some(format!("/orgs/default/projects/p/vpcs/v/subnets/{id}")),
            display_name: id.to_string(),
            tags: ownership("cluster-1", Some(namespace), name, uid, "subnet"),
            ..Default::default()
        }
    }

    fn service(script: Arc<Script>) -> SubnetService {
        SubnetService::new(
            Client::new(script, vec!["mgr-1".to_string()], "admin", "password", "cluster-1")
                .expect("client to build"),
        )
    }

    #[test]
    fn store_should_index_by_associated_resource() {
        let service = service(Script::new(vec![]));
        service.store.update(subnet("s1", "ns-a", "subnet-a", "uid-1"));

        let hits = service.store.by_index(BY_ASSOCIATED_RESOURCE, "p:v:s1");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "s1");
        assert_eq!(service.by_cr_name("ns-a", "subnet-a").len(), 1);
        assert_eq!(service.by_cr_uid("uid-1").len(), 1);
    }

    #[tokio::test]
    async fn get_by_associated_should_prefer_the_store() {
        let service = service(Script::new(vec![]));
        service.store.update(subnet("s1", "ns-a", "subnet-a", "uid-1"));

        let hit = service
            .get_by_associated(&"p:v:s1".parse().expect("key to parse"))
            .await
            .expect("lookup to succeed");

        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn get_by_associated_should_fall_back_to_the_api() {
        let script = Script::new(vec![(
            200,
            r#"{"id":"s9","display_name":"shared-9","path":"/orgs/default/projects/p/vpcs/v/subnets/s9"}"#,
        )]);
        let service = service(script.to_owned());

        let hit = service
            .get_by_associated(&"p:v:s9".parse().expect("key to parse"))
            .await
            .expect("lookup to succeed")
            .expect("subnet to be found");

        assert_eq!(hit.display_name, "shared-9");
        // mirrored into the store on the way back
        assert_eq!(service.store.by_index(BY_ASSOCIATED_RESOURCE, "p:v:s9").len(), 1);
        assert_eq!(
            script.seen.lock().expect("seen mutex to be healthy")[0].1,
            "https://mgr-1/policy/api/v1/orgs/default/projects/p/vpcs/v/subnets/s9"
        );
    }

    #[tokio::test]
    async fn cleanup_should_only_collect_orphans() {
        let body = format!(
            r#"{{"results":[{},{}],"cursor":"2","result_count":2}}"#,
            serde_json::to_string(&subnet("s1", "ns-a", "subnet-a", "uid-live"))
                .expect("subnet to serialize"),
            serde_json::to_string(&subnet("s2", "ns-a", "subnet-b", "uid-gone"))
                .expect("subnet to serialize"),
        );
        let script = Script::new(vec![(200, body.as_str()), (200, "{}")]);
        let service = service(script.to_owned());

        let mut live = crate::svc::nsx::gc::LiveSet::default();
        live.insert("subnet", "uid-live");

        let ctx = CleanupContext {
            nsx: service.client.to_owned(),
            cluster: "cluster-1".to_string(),
            live,
        };

        SubnetCleanup { service }
            .clean(&ctx)
            .await
            .expect("cleanup to succeed");

        let seen = script.seen.lock().expect("seen mutex to be healthy").to_owned();
        let deletes: Vec<_> = seen.iter().filter(|(method, _)| method == "DELETE").collect();

        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].1.ends_with("/subnets/s2"));
    }
}

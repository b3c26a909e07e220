//! # Policy module
//!
//! This module provide the fabric-side crud operations for security policies
//! and their groups, applied through the hierarchical api

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::svc::nsx::{
    client::{Client, POLICY_BASE},
    gc::{Cleanup, CleanupContext, Phase},
    model::{ChildNode, Group, OrgRoot, SecurityPolicy},
    path::VpcPath,
    query::TagQuery,
    store::{Identified, IndexFn, Store, BY_CR_UID, BY_NAMESPACE},
    tag::{find, SCOPE_CLUSTER, SCOPE_CR_UID, SCOPE_NAMESPACE},
    Error,
};

// -----------------------------------------------------------------------------
// Indexers

fn policy_by_namespace(policy: &SecurityPolicy) -> Vec<String> {
    find(&policy.tags, SCOPE_NAMESPACE)
        .map(|ns| vec![ns.to_string()])
        .unwrap_or_default()
}

fn policy_by_cr_uid(policy: &SecurityPolicy) -> Vec<String> {
    find(&policy.tags, SCOPE_CR_UID)
        .map(|uid| vec![uid.to_string()])
        .unwrap_or_default()
}

pub fn indexers() -> Vec<(&'static str, IndexFn<SecurityPolicy>)> {
    vec![
        (BY_NAMESPACE, policy_by_namespace),
        (BY_CR_UID, policy_by_cr_uid),
    ]
}

// -----------------------------------------------------------------------------
// Helper functions

/// reference node used to walk the hierarchy down to the vpc carrying the
/// intended children
fn reference(id: &str, target_type: &str, children: Vec<ChildNode>) -> ChildNode {
    ChildNode {
        resource_type: "ChildResourceReference".to_string(),
        marked_for_delete: false,
        body: serde_json::json!({
            "id": id,
            "target_type": target_type,
        }),
        children,
    }
}

// -----------------------------------------------------------------------------
// PolicyService structure

#[derive(Clone)]
pub struct PolicyService {
    pub client: Client,
    pub store: Arc<Store<SecurityPolicy>>,
}

impl PolicyService {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            store: Arc::new(Store::new(&indexers())),
        }
    }

    pub async fn populate(&self) -> Result<(), Error> {
        let policies: Vec<SecurityPolicy> = self
            .client
            .query_by_tags(
                &TagQuery::new(SecurityPolicy::RESOURCE_TYPE)
                    .tagged(SCOPE_CLUSTER, self.client.cluster()),
            )
            .await?;

        info!(count = policies.len(), "Populate security policy store from the fabric");
        for policy in policies {
            self.store.update(policy);
        }

        self.store.done_synced();
        Ok(())
    }

    /// build the intended-children tree for one policy and its groups, each
    /// node carries its own delete marker
    fn tree(
        vpc: &VpcPath,
        policy: &SecurityPolicy,
        groups: &[Group],
        delete: bool,
    ) -> Result<OrgRoot, Error> {
        let mut nodes = Vec::with_capacity(groups.len() + 1);
        for group in groups {
            nodes.push(ChildNode::wrap(Group::RESOURCE_TYPE, group, delete).map_err(Error::Serialize)?);
        }

        nodes.push(
            ChildNode::wrap(SecurityPolicy::RESOURCE_TYPE, policy, delete).map_err(Error::Serialize)?,
        );

        Ok(OrgRoot::with(vec![reference(
            &vpc.project,
            "Project",
            vec![reference(&vpc.vpc, "Vpc", nodes)],
        )]))
    }

    /// realize the policy, its rules and its groups through one atomic
    /// hierarchical patch
    pub async fn apply(
        &self,
        vpc: &VpcPath,
        mut policy: SecurityPolicy,
        groups: &[Group],
    ) -> Result<SecurityPolicy, Error> {
        let path = format!("{vpc}/security-policies/{}", policy.id);
        policy.path = Some(path.to_owned());

        debug!(path = &path, rules = policy.rules.len(), groups = groups.len(), "Apply security policy on the fabric");
        self.client
            .apply_tree(&vpc.org, &Self::tree(vpc, &policy, groups, false)?)
            .await?;

        self.store.update(policy.to_owned());
        Ok(policy)
    }

    /// remove the policy and its groups through one atomic hierarchical
    /// patch with per-node delete markers
    pub async fn delete(
        &self,
        vpc: &VpcPath,
        mut policy: SecurityPolicy,
        groups: &[Group],
    ) -> Result<(), Error> {
        let path = format!("{vpc}/security-policies/{}", policy.id);
        policy.path = Some(path.to_owned());

        debug!(path = &path, "Delete security policy on the fabric");
        self.client
            .apply_tree(&vpc.org, &Self::tree(vpc, &policy, groups, true)?)
            .await?;

        self.store.delete(&path);
        Ok(())
    }

    pub fn by_cr_uid(&self, uid: &str) -> Vec<Arc<SecurityPolicy>> {
        self.store.by_index(BY_CR_UID, uid)
    }
}

// -----------------------------------------------------------------------------
// PolicyCleanup structure

pub struct PolicyCleanup {
    pub service: PolicyService,
}

#[async_trait]
impl Cleanup for PolicyCleanup {
    fn name(&self) -> &'static str {
        "security-policies"
    }

    fn phase(&self) -> Phase {
        Phase::VpcChildren
    }

    async fn clean(&self, ctx: &CleanupContext) -> Result<(), Error> {
        let policies: Vec<SecurityPolicy> = ctx
            .nsx
            .query_by_tags(
                &TagQuery::new(SecurityPolicy::RESOURCE_TYPE).tagged(SCOPE_CLUSTER, &ctx.cluster),
            )
            .await?;

        for policy in policies {
            if ctx.live.orphaned(&ctx.cluster, &policy.tags) {
                info!(path = policy.id(), "Collect orphaned security policy");
                self.service.client.delete(&format!("{POLICY_BASE}{}", policy.id())).await?;
                self.service.store.delete(policy.id());
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// GroupCleanup structure

pub struct GroupCleanup {
    pub client: Client,
}

#[async_trait]
impl Cleanup for GroupCleanup {
    fn name(&self) -> &'static str {
        "groups"
    }

    fn phase(&self) -> Phase {
        Phase::VpcChildren
    }

    async fn clean(&self, ctx: &CleanupContext) -> Result<(), Error> {
        let groups: Vec<Group> = ctx
            .nsx
            .query_by_tags(&TagQuery::new(Group::RESOURCE_TYPE).tagged(SCOPE_CLUSTER, &ctx.cluster))
            .await?;

        for group in groups {
            if ctx.live.orphaned(&ctx.cluster, &group.tags) {
                info!(path = group.id(), "Collect orphaned group");
                self.client.delete(&format!("{POLICY_BASE}{}", group.id())).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::nsx::{client::tests::Script, tag::ownership};

    #[tokio::test]
    async fn apply_should_patch_the_org_hierarchy() {
        let script = Script::new(vec![(200, "{}")]);
        let service = PolicyService::new(
            Client::new(
                script.to_owned(),
                vec!["mgr-1".to_string()],
                "admin",
                "password",
                "cluster-1",
            )
            .expect("client to build"),
        );

        let vpc: VpcPath = "/orgs/default/projects/p/vpcs/v".parse().expect("path to parse");
        let policy = SecurityPolicy {
            id: "sp-1".to_string(),
            display_name: "sp-1".to_string(),
            tags: ownership("cluster-1", Some("ns-a"), "sp-1", "uid-1", "securitypolicy"),
            ..Default::default()
        };

        let realized = service
            .apply(&vpc, policy, &[])
            .await
            .expect("policy to be applied");

        assert_eq!(
            realized.path.as_deref(),
            Some("/orgs/default/projects/p/vpcs/v/security-policies/sp-1")
        );

        let seen = script.seen.lock().expect("seen mutex to be healthy").to_owned();
        assert_eq!(seen[0].0, "PATCH");
        assert_eq!(seen[0].1, "https://mgr-1/policy/api/v1/orgs/default");
        assert_eq!(service.by_cr_uid("uid-1").len(), 1);
    }

    #[test]
    fn tree_should_mark_every_node_on_delete() {
        let vpc: VpcPath = "/orgs/default/projects/p/vpcs/v".parse().expect("path to parse");
        let policy = SecurityPolicy {
            id: "sp-1".to_string(),
            display_name: "sp-1".to_string(),
            ..Default::default()
        };
        let group = Group {
            id: "g-1".to_string(),
            display_name: "g-1".to_string(),
            ..Default::default()
        };

        let root = PolicyService::tree(&vpc, &policy, &[group], true).expect("tree to build");
        let vpc_node = &root.children[0].children[0];

        assert_eq!(vpc_node.children.len(), 2);
        assert!(vpc_node.children.iter().all(|node| node.marked_for_delete));
    }
}

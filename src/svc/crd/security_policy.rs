//! # SecurityPolicy custom resource
//!
//! This module provide the security policy custom resource, a selector
//! driven ruleset translated to a fabric policy, its rules and its groups

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::Pod,
    apimachinery::pkg::{
        apis::meta::v1::{Condition, LabelSelector},
        util::intstr::IntOrString,
    },
};
use kube::{api::ListParams, Api, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::svc::{
    crd::HasConditions,
    k8s::{resource, status, Classify, Kind, Outcome, Reconcile, State},
    nsx::{
        self, model,
        path::VpcPath,
        tag,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const SECURITY_POLICY_FINALIZER: &str = "nsx.vmware.com/securitypolicy";
pub const CREATED_FOR: &str = "securitypolicy";

// -----------------------------------------------------------------------------
// PeerSelector structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PeerSelector {
    #[serde(rename = "podSelector", default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
    #[serde(rename = "vmSelector", default, skip_serializing_if = "Option::is_none")]
    pub vm_selector: Option<LabelSelector>,
    #[serde(rename = "ipBlocks", default, skip_serializing_if = "Vec::is_empty")]
    pub ip_blocks: Vec<String>,
}

// -----------------------------------------------------------------------------
// Rule enumerations

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum RuleAction {
    #[default]
    Allow,
    Drop,
    Reject,
}

impl Display for RuleAction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Drop => write!(f, "DROP"),
            Self::Reject => write!(f, "REJECT"),
        }
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum RuleDirection {
    #[default]
    In,
    Out,
}

impl Display for RuleDirection {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::In => write!(f, "IN"),
            Self::Out => write!(f, "OUT"),
        }
    }
}

// -----------------------------------------------------------------------------
// PortSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct PortSpec {
    #[serde(rename = "protocol")]
    pub protocol: String,
    /// numeric port or a named port resolved against the selected pods at
    /// reconcile time
    #[serde(rename = "port")]
    pub port: IntOrString,
}

// -----------------------------------------------------------------------------
// RuleSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct RuleSpec {
    #[serde(rename = "name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "action", default)]
    pub action: RuleAction,
    #[serde(rename = "direction", default)]
    pub direction: RuleDirection,
    #[serde(rename = "sources", default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<PeerSelector>,
    #[serde(rename = "destinations", default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<PeerSelector>,
    #[serde(rename = "ports", default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "vpc.nsx.vmware.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "SecurityPolicy")]
#[kube(singular = "securitypolicy")]
#[kube(plural = "securitypolicies")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct Spec {
    #[serde(rename = "priority", default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(rename = "appliedTo", default, skip_serializing_if = "Vec::is_empty")]
    pub applied_to: Vec<PeerSelector>,
    #[serde(rename = "rules", default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleSpec>,
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

impl HasConditions for SecurityPolicy {
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
    #[error("no pod selected by the policy exposes the named port '{0}'")]
    NamedPortUnresolved(String),
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
            Self::VpcUnready(_) | Self::NamedPortUnresolved(_) => Kind::DependencyUnready,
        }
    }
}

// -----------------------------------------------------------------------------
// Builder functions

/// label selector rendered the way the kubernetes list api expects it
fn selector_string(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .iter()
        .flatten()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// tag conditions of a fabric group from the selector's labels
fn group_expression(selector: &LabelSelector, member_type: &str) -> Vec<serde_json::Value> {
    let mut expression = vec![];

    for (key, value) in selector.match_labels.iter().flatten() {
        if !expression.is_empty() {
            expression.push(serde_json::json!({
                "resource_type": "ConjunctionOperator",
                "conjunction_operator": "AND",
            }));
        }

        expression.push(serde_json::json!({
            "resource_type": "Condition",
            "member_type": member_type,
            "key": "Tag",
            "operator": "EQUALS",
            "value": format!("{key}|{value}"),
        }));
    }

    expression
}

/// one fabric group per selector peer, identified by policy uid, rule index
/// and peer role so re-applies stay stable
fn build_group(
    peer: &PeerSelector,
    id: &str,
    namespace: &str,
    cluster: &str,
    name: &str,
    uid: &str,
) -> Option<model::Group> {
    let mut expression = vec![];

    if let Some(selector) = &peer.pod_selector {
        expression.extend(group_expression(selector, "VpcSubnetPort"));
    }

    if let Some(selector) = &peer.vm_selector {
        expression.extend(group_expression(selector, "VirtualMachine"));
    }

    if !peer.ip_blocks.is_empty() {
        expression.push(serde_json::json!({
            "resource_type": "IPAddressExpression",
            "ip_addresses": peer.ip_blocks,
        }));
    }

    if expression.is_empty() {
        return None;
    }

    Some(model::Group {
        id: id.to_string(),
        display_name: id.to_string(),
        tags: tag::ownership(cluster, Some(namespace), name, uid, CREATED_FOR),
        expression,
        ..Default::default()
    })
}

/// translate the resource into the fabric policy, its rules and the groups
/// they reference, named ports must be resolved beforehand
pub fn build(
    obj: &SecurityPolicy,
    cluster: &str,
    vpc: &VpcPath,
    resolved_ports: &[Vec<i32>],
) -> (model::SecurityPolicy, Vec<model::Group>) {
    let (namespace, name) = resource::namespaced_name(obj);
    let uid = obj.uid().unwrap_or_default();
    let policy_id = format!("{name}_{}", &uid[..uid.len().min(5)]);
    let mut groups = vec![];

    let scope: Vec<String> = obj
        .spec
        .applied_to
        .iter()
        .enumerate()
        .filter_map(|(index, peer)| {
            build_group(peer, &format!("{policy_id}_scope_{index}"), &namespace, cluster, &name, &uid)
                .map(|group| {
                    let path = format!("{vpc}/groups/{}", group.id);
                    groups.push(group);
                    path
                })
        })
        .collect();

    let rules = obj
        .spec
        .rules
        .iter()
        .enumerate()
        .map(|(index, rule)| {
            let rule_id = format!("{policy_id}_{index}");
            let mut peers = |role: &str, selectors: &[PeerSelector]| -> Vec<String> {
                selectors
                    .iter()
                    .enumerate()
                    .filter_map(|(peer_index, peer)| {
                        build_group(
                            peer,
                            &format!("{rule_id}_{role}_{peer_index}"),
                            &namespace,
                            cluster,
                            &name,
                            &uid,
                        )
                        .map(|group| {
                            let path = format!("{vpc}/groups/{}", group.id);
                            groups.push(group);
                            path
                        })
                    })
                    .collect()
            };

            let source_groups = peers("src", &rule.sources);
            let destination_groups = peers("dst", &rule.destinations);

            let service_entries = rule
                .ports
                .iter()
                .map(|port| {
                    let destinations: Vec<String> = match &port.port {
                        IntOrString::Int(number) => vec![number.to_string()],
                        IntOrString::String(_) => resolved_ports
                            .get(index)
                            .map(|numbers| numbers.iter().map(i32::to_string).collect())
                            .unwrap_or_default(),
                    };

                    serde_json::json!({
                        "resource_type": "L4PortSetServiceEntry",
                        "l4_protocol": port.protocol,
                        "destination_ports": destinations,
                    })
                })
                .collect();

            model::Rule {
                id: rule_id.to_owned(),
                display_name: rule.name.to_owned().unwrap_or(rule_id),
                direction: rule.direction.to_string(),
                action: rule.action.to_string(),
                sequence_number: Some(index as i64),
                source_groups,
                destination_groups,
                service_entries,
                ..Default::default()
            }
        })
        .collect();

    let policy = model::SecurityPolicy {
        id: policy_id.to_owned(),
        display_name: name.to_owned(),
        tags: tag::ownership(cluster, Some(&namespace), &name, &uid, CREATED_FOR),
        sequence_number: obj.spec.priority,
        scope,
        rules,
        ..Default::default()
    };

    (policy, groups)
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl Reconciler {
    /// resolve every named port of every rule against the pods the policy
    /// applies to, a symbolic name maps to the numeric ports actually
    /// exposed by matching pods
    async fn resolve_named_ports(
        state: &Arc<State>,
        namespace: &str,
        obj: &SecurityPolicy,
    ) -> Result<Vec<Vec<i32>>, ReconcilerError> {
        let mut resolved = Vec::with_capacity(obj.spec.rules.len());

        for rule in &obj.spec.rules {
            let mut ports = vec![];

            for port in &rule.ports {
                let IntOrString::String(named) = &port.port else {
                    continue;
                };

                let pods: Api<Pod> = Api::namespaced(state.kube.to_owned(), namespace);
                let mut params = ListParams::default();
                if let Some(selector) = obj
                    .spec
                    .applied_to
                    .iter()
                    .find_map(|peer| peer.pod_selector.as_ref())
                {
                    let labels = selector_string(selector);
                    if !labels.is_empty() {
                        params = params.labels(&labels);
                    }
                }

                let mut numbers: Vec<i32> = pods
                    .list(&params)
                    .await?
                    .items
                    .iter()
                    .flat_map(|pod| pod.spec.iter())
                    .flat_map(|spec| spec.containers.iter())
                    .flat_map(|container| container.ports.iter().flatten())
                    .filter(|container_port| container_port.name.as_deref() == Some(named))
                    .map(|container_port| container_port.container_port)
                    .collect();

                if numbers.is_empty() {
                    return Err(ReconcilerError::NamedPortUnresolved(named.to_owned()));
                }

                numbers.sort_unstable();
                numbers.dedup();
                ports.extend(numbers);
            }

            resolved.push(ports);
        }

        Ok(resolved)
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    type Resource = SecurityPolicy;
    type Error = ReconcilerError;

    const KIND: &'static str = "SecurityPolicy";
    const FINALIZER: Option<&'static str> = Some(SECURITY_POLICY_FINALIZER);

    fn api(state: &State, namespace: Option<&str>) -> Api<SecurityPolicy> {
        match namespace {
            Some(namespace) => Api::namespaced(state.kube.to_owned(), namespace),
            None => Api::all(state.kube.to_owned()),
        }
    }

    fn validate(&self, obj: &SecurityPolicy) -> Result<(), String> {
        if obj.spec.rules.is_empty() {
            return Err("a security policy needs at least one rule".to_string());
        }

        for rule in &obj.spec.rules {
            for port in &rule.ports {
                if !matches!(port.protocol.as_str(), "TCP" | "UDP") {
                    return Err(format!("unsupported protocol '{}'", port.protocol));
                }

                if let IntOrString::Int(number) = &port.port {
                    if !(1..=65535).contains(number) {
                        return Err(format!("port {number} is out of range"));
                    }
                }
            }
        }

        let selectors = obj
            .spec
            .applied_to
            .iter()
            .chain(obj.spec.rules.iter().flat_map(|rule| {
                rule.sources.iter().chain(rule.destinations.iter())
            }));

        for peer in selectors {
            for selector in [&peer.pod_selector, &peer.vm_selector].into_iter().flatten() {
                if selector
                    .match_expressions
                    .as_ref()
                    .is_some_and(|expressions| !expressions.is_empty())
                {
                    return Err("matchExpressions are not supported, use matchLabels".to_string());
                }
            }
        }

        Ok(())
    }

    async fn rejected(&self, state: &Arc<State>, obj: Arc<SecurityPolicy>, message: &str) {
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

    async fn apply(&self, state: &Arc<State>, obj: Arc<SecurityPolicy>) -> Result<Outcome, ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(obj.as_ref());
        let api = Self::api(state, Some(&namespace));

        // ---------------------------------------------------------------------
        // Step 1: the vpc must be realized and named ports resolvable

        let Some(vpc) = state.vpcs.by_namespace(&namespace) else {
            return Err(ReconcilerError::VpcUnready(namespace));
        };
        let vpc_path: VpcPath = vpc
            .path
            .as_deref()
            .ok_or_else(|| ReconcilerError::VpcUnready(namespace.to_owned()))?
            .parse()
            .map_err(nsx::Error::Path)?;

        let resolved = Self::resolve_named_ports(state, &namespace, obj.as_ref()).await?;

        // ---------------------------------------------------------------------
        // Step 2: realize policy, rules and groups atomically

        let (policy, groups) = build(obj.as_ref(), state.cluster(), &vpc_path, &resolved);
        let realized = state.policies.apply(&vpc_path, policy, &groups).await?;

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
            &format!("Security policy '{namespace}/{name}' realized"),
        )
        .await?;

        Ok(Outcome::Done)
    }

    async fn cleanup(&self, state: &Arc<State>, obj: Arc<SecurityPolicy>) -> Result<Outcome, ReconcilerError> {
        let (namespace, _) = resource::namespaced_name(obj.as_ref());

        let Some(vpc) = state.vpcs.by_namespace(&namespace) else {
            // the vpc is already gone and took the policy with it
            status::delete_success(state, Self::KIND, obj.as_ref(), "Security policy deleted").await;
            return Ok(Outcome::Done);
        };

        let vpc_path: VpcPath = match vpc.path.as_deref().map(str::parse) {
            Some(Ok(path)) => path,
            _ => {
                status::delete_success(state, Self::KIND, obj.as_ref(), "Security policy deleted").await;
                return Ok(Outcome::Done);
            }
        };

        let (policy, groups) = build(obj.as_ref(), state.cluster(), &vpc_path, &[]);
        info!(policy = &policy.id, "Delete security policy on the fabric");
        state.policies.delete(&vpc_path, policy, &groups).await?;

        status::delete_success(state, Self::KIND, obj.as_ref(), "Security policy deleted").await;
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn selector(labels: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                labels
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn policy() -> SecurityPolicy {
        let mut obj = SecurityPolicy::new(
            "allow-web",
            Spec {
                priority: Some(10),
                applied_to: vec![PeerSelector {
                    pod_selector: Some(selector(&[("app", "web")])),
                    ..Default::default()
                }],
                rules: vec![RuleSpec {
                    name: Some("ingress-http".to_string()),
                    action: RuleAction::Allow,
                    direction: RuleDirection::In,
                    sources: vec![PeerSelector {
                        ip_blocks: vec!["10.0.0.0/8".to_string()],
                        ..Default::default()
                    }],
                    ports: vec![PortSpec {
                        protocol: "TCP".to_string(),
                        port: IntOrString::Int(8080),
                    }],
                    ..Default::default()
                }],
            },
        );
        obj.metadata.namespace = Some("ns-a".to_string());
        obj.metadata.uid = Some("00000000-aaaa".to_string());
        obj
    }

    #[test]
    fn build_should_translate_rules_groups_and_scope() {
        let vpc: VpcPath = "/orgs/default/projects/p/vpcs/v".parse().expect("path to parse");
        let (fabric, groups) = build(&policy(), "cluster-1", &vpc, &[vec![]]);

        assert_eq!(fabric.display_name, "allow-web");
        assert_eq!(fabric.sequence_number, Some(10));
        assert_eq!(fabric.rules.len(), 1);
        assert_eq!(fabric.rules[0].action, "ALLOW");
        assert_eq!(fabric.rules[0].direction, "IN");
        // one scope group, one source group
        assert_eq!(groups.len(), 2);
        assert_eq!(fabric.scope.len(), 1);
        assert!(fabric.scope[0].starts_with("/orgs/default/projects/p/vpcs/v/groups/"));
        assert_eq!(fabric.rules[0].source_groups.len(), 1);
        assert!(fabric.rules[0].destination_groups.is_empty());
        assert_eq!(fabric.rules[0].service_entries.len(), 1);
    }

    #[test]
    fn validate_should_reject_unsupported_shapes() {
        let reconciler = Reconciler::default();

        assert!(reconciler.validate(&policy()).is_ok());

        let mut empty = policy();
        empty.spec.rules.clear();
        assert!(reconciler.validate(&empty).is_err());

        let mut bad_protocol = policy();
        bad_protocol.spec.rules[0].ports[0].protocol = "ICMP".to_string();
        assert!(reconciler.validate(&bad_protocol).is_err());

        let mut bad_port = policy();
        bad_port.spec.rules[0].ports[0].port = IntOrString::Int(0);
        assert!(reconciler.validate(&bad_port).is_err());
    }

    #[test]
    fn named_ports_should_use_resolved_numbers() {
        let mut obj = policy();
        obj.spec.rules[0].ports[0].port = IntOrString::String("http".to_string());

        let vpc: VpcPath = "/orgs/default/projects/p/vpcs/v".parse().expect("path to parse");
        let (fabric, _) = build(&obj, "cluster-1", &vpc, &[vec![8080, 8081]]);

        assert_eq!(
            fabric.rules[0].service_entries[0]["destination_ports"],
            serde_json::json!(["8080", "8081"])
        );
    }
}

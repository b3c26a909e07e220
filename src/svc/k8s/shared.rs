//! # Shared subnet module
//!
//! This module provide the sync algorithm reconciling a namespace's set of
//! shared-subnet representations against the configuration list, and the
//! map tracking which custom resources represent which fabric subnet

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use kube::{
    api::{ListParams, PostParams},
    Api, ResourceExt,
};
use tracing::{debug, info, warn};

use crate::svc::{
    crd::{
        binding_map::SubnetConnectionBindingMap,
        network_config::VPCNetworkConfiguration,
        subnet::{self, Subnet},
        subnet_port::SubnetPort,
        ANNOTATION_ASSOCIATED_RESOURCE,
    },
    k8s::{status, State},
    nsx::{self, path::AssociatedKey},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to execute request on the fabric, {0}")]
    Fabric(nsx::Error),
    #[error("failed to parse shared subnet path, {0}")]
    Path(nsx::path::Error),
    #[error("shared subnet '{0}' does not exist on the fabric")]
    Absent(String),
    #[error("subnet '{name}' is still referenced by {referrers}", referrers = .refs.join(", "))]
    Referenced { name: String, refs: Vec<String> },
    #[error("failed to sync {count} shared subnet(s)", count = .errors.len())]
    Aggregate { errors: Vec<Error> },
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<nsx::Error> for Error {
    fn from(err: nsx::Error) -> Self {
        Self::Fabric(err)
    }
}

// -----------------------------------------------------------------------------
// ResourceMap structure

/// for each shared fabric subnet, the set of subnet custom resources that
/// represent it, mutated only within the sync algorithm
#[derive(Default)]
pub struct ResourceMap {
    inner: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, key: &AssociatedKey, namespace: &str, name: &str) {
        self.lock()
            .entry(key.to_string())
            .or_default()
            .insert(format!("{namespace}/{name}"));
    }

    pub fn deregister(&self, key: &AssociatedKey, namespace: &str, name: &str) {
        let mut inner = self.lock();
        if let Some(representations) = inner.get_mut(&key.to_string()) {
            representations.remove(&format!("{namespace}/{name}"));
            if representations.is_empty() {
                inner.remove(&key.to_string());
            }
        }
    }

    /// namespaced names of the resources representing the given subnet
    pub fn representations(&self, key: &AssociatedKey) -> Vec<String> {
        self.lock()
            .get(&key.to_string())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.lock()
            .iter()
            .map(|(key, set)| (key.to_owned(), set.to_owned()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// -----------------------------------------------------------------------------
// Naming helpers

/// dns-1123 subdomain check, fabric display names do not have to comply
pub fn is_dns1123_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && label.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}

/// fnv-1a, stable across processes so retries derive the same name
fn fnv1a(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }

    hash
}

/// base name of the representation resource, the fabric display name when it
/// is a valid dns-1123 subdomain, a deterministic short hash otherwise
pub fn representation_name(display_name: &str) -> String {
    let lowered = display_name.to_lowercase();
    if is_dns1123_subdomain(&lowered) {
        lowered
    } else {
        format!("subnet-{:016x}", fnv1a(display_name))
    }
}

// -----------------------------------------------------------------------------
// Sync algorithm

/// reconcile the namespace's shared-subnet representations against the
/// configuration list, re-invoking with the same inputs performs no fabric
/// writes beyond lookups
pub async fn sync(
    state: &Arc<State>,
    namespace: &str,
    config: &VPCNetworkConfiguration,
) -> Result<(), Error> {
    let api: Api<Subnet> = Api::namespaced(state.kube.to_owned(), namespace);
    let desired = config.shared_subnet_keys().map_err(Error::Path)?;
    let mut errors = vec![];

    // -------------------------------------------------------------------------
    // Step 1: index the namespace's representations by associated key

    let mut existing: BTreeMap<String, Subnet> = BTreeMap::new();
    for item in api.list(&ListParams::default()).await?.items {
        if let Some(Ok(key)) = item.associated_resource() {
            existing.insert(key.to_string(), item);
        }
    }

    // -------------------------------------------------------------------------
    // Step 2: create a representation for every configured subnet that has
    // none yet

    for (key, _path) in &desired {
        if existing.contains_key(&key.to_string()) {
            debug!(namespace = namespace, key = key.to_string(), "Representation already exists");
            continue;
        }

        if let Err(err) = create_representation(state, &api, namespace, key).await {
            warn!(
                namespace = namespace,
                key = key.to_string(),
                error = err.to_string(),
                "Failed to create shared subnet representation"
            );

            errors.push(err);
        }
    }

    // -------------------------------------------------------------------------
    // Step 3: delete representations no longer configured, unless something
    // still references them

    let desired_keys: BTreeSet<String> = desired.iter().map(|(key, _)| key.to_string()).collect();
    for (key, item) in &existing {
        if desired_keys.contains(key) {
            continue;
        }

        match delete_representation(state, &api, namespace, item).await {
            Ok(()) => {}
            Err(err) => {
                warn!(
                    namespace = namespace,
                    name = item.name_any(),
                    error = err.to_string(),
                    "Failed to delete unused shared subnet representation"
                );

                errors.push(err);
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Aggregate { errors })
    }
}

async fn create_representation(
    state: &Arc<State>,
    api: &Api<Subnet>,
    namespace: &str,
    key: &AssociatedKey,
) -> Result<(), Error> {
    // ---------------------------------------------------------------------
    // the fabric subnet gives the representation its base name

    let shared = state
        .subnets
        .get_by_associated(key)
        .await?
        .ok_or_else(|| Error::Absent(key.to_string()))?;

    let base = representation_name(&shared.display_name);
    let annotations: BTreeMap<String, String> = [(
        ANNOTATION_ASSOCIATED_RESOURCE.to_string(),
        key.to_string(),
    )]
    .into();

    let mut representation = Subnet::new(&base, subnet::Spec::default());
    representation.metadata.namespace = Some(namespace.to_string());
    representation.metadata.annotations = Some(annotations);

    // name taken by an unrelated resource, let the api server pick a suffix
    if api.get_opt(&base).await?.is_some() {
        representation.metadata.name = None;
        representation.metadata.generate_name = Some(format!("{base}-"));
    }

    let created = api.create(&PostParams::default(), &representation).await?;
    let name = created.name_any();

    info!(
        namespace = namespace,
        name = &name,
        key = key.to_string(),
        "Created shared subnet representation"
    );
    state.shared_subnets.register(key, namespace, &name);
    status::update_success(
        state,
        api,
        "Subnet",
        &created,
        &format!("Shared subnet '{key}' imported"),
    )
    .await?;

    Ok(())
}

pub(crate) async fn delete_representation(
    state: &Arc<State>,
    api: &Api<Subnet>,
    namespace: &str,
    item: &Subnet,
) -> Result<(), Error> {
    let name = item.name_any();

    // ---------------------------------------------------------------------
    // reference guard, the field-selector queries are the contract

    let mut refs = vec![];

    let ports: Api<SubnetPort> = Api::namespaced(state.kube.to_owned(), namespace);
    for port in ports
        .list(&ListParams::default().fields(&format!("spec.subnet={name}")))
        .await?
        .items
    {
        refs.push(format!("subnetport/{}", port.name_any()));
    }

    let bindings: Api<SubnetConnectionBindingMap> =
        Api::namespaced(state.kube.to_owned(), namespace);
    for selector in [
        format!("spec.subnetName={name}"),
        format!("spec.targetSubnetName={name}"),
    ] {
        for binding in bindings
            .list(&ListParams::default().fields(&selector))
            .await?
            .items
        {
            refs.push(format!("subnetconnectionbindingmap/{}", binding.name_any()));
        }
    }

    if !refs.is_empty() {
        refs.sort();
        refs.dedup();
        return Err(Error::Referenced { name, refs });
    }

    // ---------------------------------------------------------------------
    // unreferenced, drop the resource and its map entry

    api.delete(&name, &Default::default()).await?;

    if let Some(Ok(key)) = item.associated_resource() {
        state.shared_subnets.deregister(&key, namespace, &name);
    }

    info!(namespace = namespace, name = &name, "Deleted unused shared subnet representation");
    status::delete_success(state, "Subnet", item, "Shared subnet released").await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn representation_name_should_keep_valid_names() {
        assert_eq!(representation_name("shared-web"), "shared-web");
        assert_eq!(representation_name("Shared-Web"), "shared-web");
        assert_eq!(representation_name("a.b.c"), "a.b.c");
    }

    #[test]
    fn representation_name_should_hash_invalid_names() {
        let hashed = representation_name("Shared Subnet (prod)");

        assert!(hashed.starts_with("subnet-"));
        assert!(is_dns1123_subdomain(&hashed));
        // deterministic across invocations
        assert_eq!(hashed, representation_name("Shared Subnet (prod)"));
        assert_ne!(hashed, representation_name("Shared Subnet (dev)"));
    }

    #[test]
    fn dns1123_check_should_follow_the_grammar() {
        assert!(is_dns1123_subdomain("a"));
        assert!(is_dns1123_subdomain("shared-web-1"));
        assert!(is_dns1123_subdomain("a.b-c.d"));
        assert!(!is_dns1123_subdomain(""));
        assert!(!is_dns1123_subdomain("-leading"));
        assert!(!is_dns1123_subdomain("trailing-"));
        assert!(!is_dns1123_subdomain("Upper"));
        assert!(!is_dns1123_subdomain("under_score"));
        assert!(!is_dns1123_subdomain(&"x".repeat(254)));
    }

    #[test]
    fn resource_map_should_track_representations() {
        let map = ResourceMap::new();
        let key: AssociatedKey = "p:v:s1".parse().expect("key to parse");

        map.register(&key, "ns-a", "shared-web");
        map.register(&key, "ns-b", "shared-web");

        assert_eq!(
            map.representations(&key),
            vec!["ns-a/shared-web".to_string(), "ns-b/shared-web".to_string()]
        );

        map.deregister(&key, "ns-a", "shared-web");
        assert_eq!(map.representations(&key), vec!["ns-b/shared-web".to_string()]);

        // the last representation going away drops the whole entry
        map.deregister(&key, "ns-b", "shared-web");
        assert!(map.is_empty());
    }

    #[test]
    fn register_should_be_idempotent() {
        let map = ResourceMap::new();
        let key: AssociatedKey = "p:v:s1".parse().expect("key to parse");

        map.register(&key, "ns-a", "shared-web");
        map.register(&key, "ns-a", "shared-web");

        assert_eq!(map.representations(&key).len(), 1);
    }
}

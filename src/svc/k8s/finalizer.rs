//! # Finalizer module
//!
//! This module provide the finalizer step of the reconcile skeleton, every
//! controller guards its delete path with a marker so owned fabric objects
//! are torn down before the resource goes away

use std::fmt::Debug;

use kube::{
    api::{Patch, PatchParams},
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource carries the given finalizer
pub fn contains<T>(obj: &T, name: &str) -> bool
where
    T: Resource,
{
    obj.meta()
        .finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|finalizer| finalizer == name)
}

/// finalizer list with the marker appended, `None` when it is already there
/// and no write is needed
fn appended<T>(obj: &T, name: &str) -> Option<Vec<String>>
where
    T: Resource,
{
    if contains(obj, name) {
        return None;
    }

    let mut finalizers = obj.meta().finalizers.to_owned().unwrap_or_default();
    finalizers.push(name.to_string());

    Some(finalizers)
}

/// finalizer list without the marker, `None` when it was never set
fn removed<T>(obj: &T, name: &str) -> Option<Vec<String>>
where
    T: Resource,
{
    if !contains(obj, name) {
        return None;
    }

    Some(
        obj.meta()
            .finalizers
            .iter()
            .flatten()
            .filter(|finalizer| *finalizer != name)
            .cloned()
            .collect(),
    )
}

/// set the controller's finalizer on the resource, returns if a patch was
/// written, in which case the next iteration is already on its way
pub async fn ensure<T>(api: &Api<T>, obj: &T, name: &str) -> Result<bool, kube::Error>
where
    T: Resource + ResourceExt + DeserializeOwned + Clone + Debug,
{
    let Some(finalizers) = appended(obj, name) else {
        return Ok(false);
    };

    debug!(name = obj.name_any(), finalizer = name, "Set finalizer on resource");
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;

    Ok(true)
}

/// drop the controller's finalizer once the owned fabric objects are gone,
/// letting the api server complete the deletion
pub async fn release<T>(api: &Api<T>, obj: &T, name: &str) -> Result<(), kube::Error>
where
    T: Resource + ResourceExt + DeserializeOwned + Clone + Debug,
{
    let Some(finalizers) = removed(obj, name) else {
        return Ok(());
    };

    debug!(name = obj.name_any(), finalizer = name, "Release finalizer on resource");
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;

    use super::*;

    fn with_finalizers(finalizers: &[&str]) -> ConfigMap {
        let mut obj = ConfigMap::default();
        obj.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        obj
    }

    #[test]
    fn appended_should_skip_the_write_when_already_set() {
        let obj = with_finalizers(&["nsx.vmware.com/subnet"]);

        assert_eq!(appended(&obj, "nsx.vmware.com/subnet"), None);
        assert_eq!(
            appended(&ConfigMap::default(), "nsx.vmware.com/subnet"),
            Some(vec!["nsx.vmware.com/subnet".to_string()])
        );
    }

    #[test]
    fn removed_should_keep_foreign_finalizers() {
        let obj = with_finalizers(&["kubernetes.io/pvc-protection", "nsx.vmware.com/subnet"]);

        assert_eq!(
            removed(&obj, "nsx.vmware.com/subnet"),
            Some(vec!["kubernetes.io/pvc-protection".to_string()])
        );
        // nothing to release when the marker was never set
        assert_eq!(removed(&ConfigMap::default(), "nsx.vmware.com/subnet"), None);
    }

    #[test]
    fn contains_should_match_exactly() {
        let obj = with_finalizers(&["nsx.vmware.com/subnet"]);

        assert!(contains(&obj, "nsx.vmware.com/subnet"));
        assert!(!contains(&obj, "nsx.vmware.com/subnetset"));
        assert!(!contains(&ConfigMap::default(), "nsx.vmware.com/subnet"));
    }
}

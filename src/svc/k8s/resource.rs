//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`]

use std::fmt::Debug;

use k8s_openapi::{
    api::core::v1::ObjectReference, apimachinery::pkg::apis::meta::v1::OwnerReference,
    NamespaceResourceScope,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource.
///
/// # Panic
///
/// panic if the namespace or name is null which is impossible btw
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (
        obj.namespace()
            .expect("resource to be owned by a namespace"),
        obj.name_any(),
    )
}

/// returns differnce between the two given object serialize as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// make a patch request on the given resource using the given patch
pub async fn patch<T>(client: Client, obj: &T, patch: json_patch::Patch) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);

    if patch.0.is_empty() {
        debug!(name = &name, namespace = &namespace, "skip patch request on resource, no operation to apply");
        return Ok(obj.to_owned());
    }

    debug!(name = &name, namespace = &namespace, "execute patch request on resource");
    Api::namespaced(client, &namespace)
        .patch(&name, &PatchParams::default(), &Patch::Json::<T>(patch))
        .await
}

/// make a patch request on the given resource's status using the given patch
pub async fn patch_status<T>(
    client: Client,
    obj: T,
    patch: json_patch::Patch,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(&obj);

    if patch.0.is_empty() {
        debug!(name = &name, namespace = &namespace, "skip patch request on resource's status, no operation to apply");
        return Ok(obj);
    }

    debug!(name = &name, namespace = &namespace, "execute patch request on resource's status");
    Api::namespaced(client, &namespace)
        .patch_status(&name, &PatchParams::default(), &Patch::Json::<T>(patch))
        .await
}

/// create the resource, if it already exists patch it with the difference
pub async fn upsert<T>(client: Client, obj: &T) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);
    let api: Api<T> = Api::namespaced(client.to_owned(), &namespace);

    match api.get_opt(&name).await? {
        None => api.create(&PostParams::default(), obj).await,
        Some(found) => {
            let diff = diff(&found, obj).map_err(kube::Error::SerdeError)?;
            patch(client, &found, diff).await
        }
    }
}

/// returns a owner references object pointing to the given resource
pub fn owner_reference<T>(obj: &T) -> OwnerReference
where
    T: ResourceExt + Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: T::api_version(&()).to_string(),
        block_owner_deletion: Some(true),
        controller: None,
        kind: T::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj
            .uid()
            .expect("to have an unique identifier provided by kubernetes"),
    }
}

/// returns an object reference pointing to the given resource
pub fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: ResourceExt + Resource<DynamicType = ()>,
{
    ObjectReference {
        api_version: Some(T::api_version(&()).to_string()),
        kind: Some(T::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.uid(),
        ..Default::default()
    }
}

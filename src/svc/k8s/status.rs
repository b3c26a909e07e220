//! # Status module
//!
//! This module provide the condition-based status writer shared by every
//! reconciler, writes retry on conflict a bounded number of times

use std::{fmt::Debug, sync::Arc};

use kube::{Api, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::svc::{
    crd::{ready_condition, upsert_condition, HasConditions},
    k8s::{recorder, resource, State},
    telemetry::metrics::{
        CONTROLLER_DELETE_FAIL_TOTAL, CONTROLLER_DELETE_SUCCESS_TOTAL, CONTROLLER_DELETE_TOTAL,
        CONTROLLER_UPDATE_FAIL_TOTAL, CONTROLLER_UPDATE_SUCCESS_TOTAL, CONTROLLER_UPDATE_TOTAL,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const STATUS_WRITE_RETRIES: usize = 3;

pub const REASON_REALIZED: &str = "Realized";
pub const REASON_APPLY_FAILED: &str = "ApplyFailed";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_DEPENDENCY_UNREADY: &str = "DependencyNotReady";

// -----------------------------------------------------------------------------
// Helper functions

/// set `Ready=True`, bump the update counters and emit a success event
pub async fn update_success<T>(
    state: &Arc<State>,
    api: &Api<T>,
    kind: &str,
    obj: &T,
    message: &str,
) -> Result<(), kube::Error>
where
    T: Resource<DynamicType = ()>
        + ResourceExt
        + HasConditions
        + DeserializeOwned
        + Serialize
        + Clone
        + Debug,
{
    CONTROLLER_UPDATE_TOTAL.with_label_values(&[kind]).inc();

    let result = write_ready(api, obj, true, REASON_REALIZED, message).await;
    match &result {
        Ok(()) => {
            CONTROLLER_UPDATE_SUCCESS_TOTAL.with_label_values(&[kind]).inc();
            let _ = recorder::normal(state.kube.to_owned(), obj, &"Update", message).await;
        }
        Err(err) => {
            CONTROLLER_UPDATE_FAIL_TOTAL.with_label_values(&[kind]).inc();
            warn!(
                kind = kind,
                name = obj.name_any(),
                error = err.to_string(),
                "Failed to record success status"
            );
        }
    }

    result
}

/// set `Ready=False` with the given reason, bump the failure counters and
/// emit a warning event
pub async fn update_fail<T>(
    state: &Arc<State>,
    api: &Api<T>,
    kind: &str,
    obj: &T,
    reason: &str,
    message: &str,
) -> Result<(), kube::Error>
where
    T: Resource<DynamicType = ()>
        + ResourceExt
        + HasConditions
        + DeserializeOwned
        + Serialize
        + Clone
        + Debug,
{
    CONTROLLER_UPDATE_TOTAL.with_label_values(&[kind]).inc();
    CONTROLLER_UPDATE_FAIL_TOTAL.with_label_values(&[kind]).inc();

    let _ = recorder::warning(state.kube.to_owned(), obj, &"Update", message).await;
    write_ready(api, obj, false, reason, message).await
}

/// bump the delete counters and emit a success event, the object is on its
/// way out so no condition is written
pub async fn delete_success<T>(state: &Arc<State>, kind: &str, obj: &T, message: &str)
where
    T: Resource<DynamicType = ()> + ResourceExt + Debug,
{
    CONTROLLER_DELETE_TOTAL.with_label_values(&[kind]).inc();
    CONTROLLER_DELETE_SUCCESS_TOTAL.with_label_values(&[kind]).inc();

    let _ = recorder::normal(state.kube.to_owned(), obj, &"Delete", message).await;
}

/// bump the delete failure counters and emit a warning event
pub async fn delete_fail<T>(state: &Arc<State>, kind: &str, obj: &T, message: &str)
where
    T: Resource<DynamicType = ()> + ResourceExt + Debug,
{
    CONTROLLER_DELETE_TOTAL.with_label_values(&[kind]).inc();
    CONTROLLER_DELETE_FAIL_TOTAL.with_label_values(&[kind]).inc();

    let _ = recorder::warning(state.kube.to_owned(), obj, &"Delete", message).await;
}

/// patch `status.conditions` with a single `Ready` condition, re-reading and
/// retrying on conflict a bounded number of times, the write is skipped when
/// nothing changes
async fn write_ready<T>(
    api: &Api<T>,
    obj: &T,
    ready: bool,
    reason: &str,
    message: &str,
) -> Result<(), kube::Error>
where
    T: Resource<DynamicType = ()>
        + ResourceExt
        + HasConditions
        + DeserializeOwned
        + Serialize
        + Clone
        + Debug,
{
    let name = obj.name_any();

    for attempt in 0..STATUS_WRITE_RETRIES {
        let latest = api.get(&name).await?;
        let mut modified = latest.to_owned();
        let changed = upsert_condition(
            modified.conditions_mut(),
            ready_condition(ready, reason, message),
        );

        if !changed {
            debug!(name = &name, "Skip status write, condition unchanged");
            return Ok(());
        }

        let patch = resource::diff(&latest, &modified).map_err(kube::Error::SerdeError)?;
        match api
            .patch_status(
                &name,
                &kube::api::PatchParams::default(),
                &kube::api::Patch::Json::<T>(patch),
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                if attempt + 1 == STATUS_WRITE_RETRIES {
                    return Err(kube::Error::Api(response));
                }

                debug!(name = &name, attempt = attempt, "Conflict on status write, re-read and retry");
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

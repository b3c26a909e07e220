//! # Event recorder module
//!
//! This module provide an alternative to the golang EventRecorder structure
//!
//! See following links for more details:
//! - <https://book-v1.book.kubebuilder.io/beyond_basics/creating_events.html>
//! - <https://github.com/kubernetes/client-go/blob/master/tools/record/event.go#L56>

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use k8s_openapi::api::core::v1::Event;
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

use crate::svc::k8s::resource;

pub mod event;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse '{0}', available options are 'normal' or 'warning'")]
    Parse(String),
}

// -----------------------------------------------------------------------------
// Level enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub enum Level {
    Warning,
    Normal,
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "warning" => Self::Warning,
            "normal" => Self::Normal,
            _ => {
                return Err(Error::Parse(s.to_string()));
            }
        })
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "Warning"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper methods

/// record an event for the given object
pub async fn record<T, U>(
    client: Client,
    obj: &T,
    kind: &Level,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: ResourceExt + Resource<DynamicType = ()> + Debug,
    U: ToString + Debug,
{
    debug!(
        action = action.to_string(),
        namespace = obj.namespace().unwrap_or_else(|| "<none>".to_string()),
        name = obj.name_any(),
        message = message,
        "Create event for resource",
    );

    resource::upsert(client, &event::new(obj, kind, action, message)).await
}

/// shortcut for the [`record`] method with the 'Normal' [`Level`]
pub async fn normal<T, U>(
    client: Client,
    obj: &T,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: ResourceExt + Resource<DynamicType = ()> + Debug,
    U: ToString + Debug,
{
    record(client, obj, &Level::Normal, action, message).await
}

/// shortcut for the [`record`] method with the 'Warning' [`Level`]
pub async fn warning<T, U>(
    client: Client,
    obj: &T,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: ResourceExt + Resource<DynamicType = ()> + Debug,
    U: ToString + Debug,
{
    record(client, obj, &Level::Warning, action, message).await
}

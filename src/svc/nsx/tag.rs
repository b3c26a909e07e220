//! # Tag module
//!
//! This module provide the marker tags through which the operator owns
//! fabric objects

use crate::svc::nsx::model::Tag;

// -----------------------------------------------------------------------------
// Constants

pub const SCOPE_CLUSTER: &str = "nsx-op/cluster";
pub const SCOPE_NAMESPACE: &str = "nsx-op/namespace";
pub const SCOPE_CREATED_FOR: &str = "nsx-op/created_for";
pub const SCOPE_CR_NAME: &str = "nsx-op/cr_name";
pub const SCOPE_CR_UID: &str = "nsx-op/cr_uid";

// -----------------------------------------------------------------------------
// Helper functions

/// returns the ownership tag set attached to every object the operator
/// creates on the fabric
pub fn ownership(
    cluster: &str,
    namespace: Option<&str>,
    name: &str,
    uid: &str,
    created_for: &str,
) -> Vec<Tag> {
    let mut tags = vec![
        Tag::new(SCOPE_CLUSTER, cluster),
        Tag::new(SCOPE_CREATED_FOR, created_for),
        Tag::new(SCOPE_CR_NAME, name),
        Tag::new(SCOPE_CR_UID, uid),
    ];

    if let Some(namespace) = namespace {
        tags.push(Tag::new(SCOPE_NAMESPACE, namespace));
    }

    tags
}

/// returns the value of the tag with the given scope
pub fn find<'a>(tags: &'a [Tag], scope: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.scope == scope)
        .map(|tag| tag.tag.as_str())
}

/// returns if the tag set carries this cluster's ownership marker, objects
/// without it are externally managed and must never be deleted
pub fn owned_by(tags: &[Tag], cluster: &str) -> bool {
    find(tags, SCOPE_CLUSTER) == Some(cluster)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_should_carry_all_marker_scopes() {
        let tags = ownership("cluster-1", Some("ns-a"), "subnet-a", "uid-1", "subnet");

        assert_eq!(find(&tags, SCOPE_CLUSTER), Some("cluster-1"));
        assert_eq!(find(&tags, SCOPE_NAMESPACE), Some("ns-a"));
        assert_eq!(find(&tags, SCOPE_CR_NAME), Some("subnet-a"));
        assert_eq!(find(&tags, SCOPE_CR_UID), Some("uid-1"));
        assert_eq!(find(&tags, SCOPE_CREATED_FOR), Some("subnet"));
    }

    #[test]
    fn cluster_scoped_objects_should_omit_namespace() {
        let tags = ownership("cluster-1", None, "vpc-a", "uid-1", "vpc");

        assert_eq!(find(&tags, SCOPE_NAMESPACE), None);
    }

    #[test]
    fn foreign_objects_should_not_be_owned() {
        let tags = vec![Tag::new("ncp/cluster", "cluster-1")];

        assert!(!owned_by(&tags, "cluster-1"));
        assert!(owned_by(
            &ownership("cluster-1", None, "x", "u", "vpc"),
            "cluster-1"
        ));
        assert!(!owned_by(
            &ownership("cluster-2", None, "x", "u", "vpc"),
            "cluster-1"
        ));
    }
}

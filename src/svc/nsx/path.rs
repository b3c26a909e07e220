//! # Path module
//!
//! This module provide parsers and formatters for the hierarchical policy
//! paths that identify fabric objects

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_ORG: &str = "default";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, PartialEq, Eq, Debug)]
pub enum Error {
    #[error("failed to parse path '{0}', expected '/orgs/<org>/projects/<project>/vpcs/<vpc>/...'")]
    Malformed(String),
    #[error("failed to parse path '{0}', component '{1}' is empty")]
    EmptyComponent(String, &'static str),
    #[error("failed to parse associated resource key '{0}', expected '<project>:<vpc>:<resource>'")]
    MalformedKey(String),
}

// -----------------------------------------------------------------------------
// ProjectPath structure

/// identity of a fabric project, `/orgs/<org>/projects/<project>`
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub struct ProjectPath {
    pub org: String,
    pub project: String,
}

impl Display for ProjectPath {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "/orgs/{}/projects/{}", self.org, self.project)
    }
}

impl FromStr for ProjectPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = components(s)?;
        match components.as_slice() {
            [("orgs", org), ("projects", project)] => Ok(Self {
                org: org.to_string(),
                project: project.to_string(),
            }),
            _ => Err(Error::Malformed(s.to_string())),
        }
    }
}

// -----------------------------------------------------------------------------
// VpcPath structure

/// identity of a vpc, `/orgs/<org>/projects/<project>/vpcs/<vpc>`
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub struct VpcPath {
    pub org: String,
    pub project: String,
    pub vpc: String,
}

impl Display for VpcPath {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "/orgs/{}/projects/{}/vpcs/{}",
            self.org, self.project, self.vpc
        )
    }
}

impl FromStr for VpcPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = components(s)?;
        match components.as_slice() {
            [("orgs", org), ("projects", project), ("vpcs", vpc)] => Ok(Self {
                org: org.to_string(),
                project: project.to_string(),
                vpc: vpc.to_string(),
            }),
            _ => Err(Error::Malformed(s.to_string())),
        }
    }
}

// -----------------------------------------------------------------------------
// ResourcePath structure

/// identity of an object below a vpc, e.g.
/// `/orgs/<org>/projects/<project>/vpcs/<vpc>/subnets/<id>` and the analogous
/// forms for policies, rules, groups and bindings
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub struct ResourcePath {
    pub vpc: VpcPath,
    pub kind: String,
    pub id: String,
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vpc, self.kind, self.id)
    }
}

impl FromStr for ResourcePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = components(s)?;
        match components.as_slice() {
            [("orgs", org), ("projects", project), ("vpcs", vpc), (kind, id)] => Ok(Self {
                vpc: VpcPath {
                    org: org.to_string(),
                    project: project.to_string(),
                    vpc: vpc.to_string(),
                },
                kind: kind.to_string(),
                id: id.to_string(),
            }),
            _ => Err(Error::Malformed(s.to_string())),
        }
    }
}

impl ResourcePath {
    pub fn subnet(org: &str, project: &str, vpc: &str, id: &str) -> Self {
        Self {
            vpc: VpcPath {
                org: org.to_string(),
                project: project.to_string(),
                vpc: vpc.to_string(),
            },
            kind: "subnets".to_string(),
            id: id.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// AssociatedKey structure

/// canonical short identity of a fabric subnet, `<project>:<vpc>:<subnet>`
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub struct AssociatedKey {
    pub project: String,
    pub vpc: String,
    pub resource: String,
}

impl Display for AssociatedKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.vpc, self.resource)
    }
}

impl FromStr for AssociatedKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // tolerate both the short triple and any full policy path form
        if s.starts_with('/') {
            return Ok(Self::from(&ResourcePath::from_str(s)?));
        }

        match s.split(':').collect::<Vec<_>>().as_slice() {
            [project, vpc, resource]
                if !project.is_empty() && !vpc.is_empty() && !resource.is_empty() =>
            {
                Ok(Self {
                    project: project.to_string(),
                    vpc: vpc.to_string(),
                    resource: resource.to_string(),
                })
            }
            _ => Err(Error::MalformedKey(s.to_string())),
        }
    }
}

impl From<&ResourcePath> for AssociatedKey {
    fn from(path: &ResourcePath) -> Self {
        Self {
            project: path.vpc.project.to_owned(),
            vpc: path.vpc.vpc.to_owned(),
            resource: path.id.to_owned(),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper functions

fn components(s: &str) -> Result<Vec<(&str, &str)>, Error> {
    let trimmed = s.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::Malformed(s.to_string()));
    }

    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.len() % 2 != 0 {
        return Err(Error::Malformed(s.to_string()));
    }

    let mut pairs = Vec::with_capacity(parts.len() / 2);
    for pair in parts.chunks(2) {
        if pair[0].is_empty() {
            return Err(Error::EmptyComponent(s.to_string(), "kind"));
        }

        if pair[1].is_empty() {
            return Err(Error::EmptyComponent(s.to_string(), "identifier"));
        }

        pairs.push((pair[0], pair[1]));
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_path_should_round_trip() {
        let formatted = ResourcePath::subnet("default", "proj-1", "vpc-1", "subnet-1").to_string();

        assert_eq!(formatted, "/orgs/default/projects/proj-1/vpcs/vpc-1/subnets/subnet-1");

        let parsed = ResourcePath::from_str(&formatted).expect("path to parse");

        assert_eq!(parsed.vpc.org, "default");
        assert_eq!(parsed.vpc.project, "proj-1");
        assert_eq!(parsed.vpc.vpc, "vpc-1");
        assert_eq!(parsed.kind, "subnets");
        assert_eq!(parsed.id, "subnet-1");
        assert_eq!(parsed.to_string(), formatted);
    }

    #[test]
    fn project_path_should_round_trip() {
        let path = ProjectPath::from_str("/orgs/default/projects/p").expect("path to parse");

        assert_eq!(path.org, "default");
        assert_eq!(path.project, "p");
        assert_eq!(path.to_string(), "/orgs/default/projects/p");
    }

    #[test]
    fn vpc_path_should_round_trip() {
        let path = VpcPath::from_str("/orgs/default/projects/p/vpcs/v").expect("path to parse");

        assert_eq!(path.to_string(), "/orgs/default/projects/p/vpcs/v");
    }

    #[test]
    fn path_should_tolerate_trailing_slash() {
        let parsed = ResourcePath::from_str("/orgs/default/projects/p/vpcs/v/subnets/s/")
            .expect("path to parse");

        assert_eq!(parsed.id, "s");
    }

    #[test]
    fn associated_key_should_be_stable_under_reformatting() {
        let path = "/orgs/default/projects/p/vpcs/v/subnets/s";
        let first = AssociatedKey::from_str(path).expect("key to parse");
        let second =
            AssociatedKey::from_str(&ResourcePath::from_str(path).expect("path to parse").to_string())
                .expect("key to parse");

        assert_eq!(first, second);
        assert_eq!(first.to_string(), "p:v:s");
    }

    #[test]
    fn associated_key_should_parse_short_form() {
        let key = AssociatedKey::from_str("p:v:s").expect("key to parse");

        assert_eq!(key.project, "p");
        assert_eq!(key.vpc, "v");
        assert_eq!(key.resource, "s");
    }

    #[test]
    fn malformed_inputs_should_be_rejected() {
        assert!(ResourcePath::from_str("/orgs/default/projects").is_err());
        assert!(ResourcePath::from_str("").is_err());
        assert!(ResourcePath::from_str("/orgs//projects/p/vpcs/v/subnets/s").is_err());
        assert!(AssociatedKey::from_str("p:v").is_err());
        assert!(AssociatedKey::from_str("::").is_err());
    }
}

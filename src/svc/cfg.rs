//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, path::PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::warn;

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";
pub const WEBHOOK_LISTEN: &str = "0.0.0.0:9443";
pub const OPERATOR_SERVICE_ACCOUNT: &str =
    "system:serviceaccount:vmware-system-nsx:nsx-vpc-operator";
pub const GARBAGE_COLLECTION_PERIOD: u64 = 60;
pub const WORKERS: usize = 2;
pub const DEFAULT_SUBNET_SIZE: u32 = 64;

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: String,
    #[serde(rename = "webhookListen")]
    pub webhook_listen: String,
    #[serde(rename = "webhookCert")]
    pub webhook_cert: Option<PathBuf>,
    #[serde(rename = "webhookKey")]
    pub webhook_key: Option<PathBuf>,
    #[serde(rename = "serviceAccount")]
    pub service_account: String,
    #[serde(rename = "gcPeriod", default = "Operator::default_gc_period")]
    pub gc_period: u64,
    #[serde(rename = "workers", default = "Operator::default_workers")]
    pub workers: usize,
    #[serde(rename = "leaseName", default = "Operator::default_lease_name")]
    pub lease_name: String,
    #[serde(rename = "leaseNamespace", default = "Operator::default_lease_namespace")]
    pub lease_namespace: String,
}

impl Operator {
    fn default_gc_period() -> u64 {
        GARBAGE_COLLECTION_PERIOD
    }

    fn default_workers() -> usize {
        WORKERS
    }

    fn default_lease_name() -> String {
        "nsx-vpc-operator".to_string()
    }

    fn default_lease_namespace() -> String {
        "vmware-system-nsx".to_string()
    }
}

// -----------------------------------------------------------------------------
// Cluster structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Cluster {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "defaultSubnetSize", default = "Cluster::default_subnet_size")]
    pub default_subnet_size: u32,
}

impl Cluster {
    fn default_subnet_size() -> u32 {
        DEFAULT_SUBNET_SIZE
    }
}

// -----------------------------------------------------------------------------
// Nsx structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Nsx {
    #[serde(rename = "endpoints")]
    pub endpoints: Vec<String>,
    #[serde(rename = "username")]
    pub username: String,
    #[serde(rename = "password")]
    pub password: String,
    #[serde(rename = "caFile")]
    pub ca_file: Option<PathBuf>,
    #[serde(rename = "thumbprint")]
    pub thumbprint: Option<String>,
    #[serde(rename = "timeout", default = "Nsx::default_timeout")]
    pub timeout: u64,
}

impl Nsx {
    fn default_timeout() -> u64 {
        30
    }
}

// -----------------------------------------------------------------------------
// ConfigurationError enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "cluster")]
    pub cluster: Cluster,
    #[serde(rename = "nsx")]
    pub nsx: Nsx,
    #[serde(rename = "debug", default = "Default::default")]
    pub debug: bool,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::builder()?
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }
}

impl Configuration {
    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, Error> {
        let builder = Config::builder()
            .set_default("operator.listen", OPERATOR_LISTEN)
            .map_err(|err| Error::Default("operator.listen".into(), err))?
            .set_default("operator.webhookListen", WEBHOOK_LISTEN)
            .map_err(|err| Error::Default("operator.webhookListen".into(), err))?
            .set_default("operator.serviceAccount", OPERATOR_SERVICE_ACCOUNT)
            .map_err(|err| Error::Default("operator.serviceAccount".into(), err))?
            .set_default("cluster.name", "kubernetes")
            .map_err(|err| Error::Default("cluster.name".into(), err))?
            .set_default("nsx.endpoints", Vec::<String>::new())
            .map_err(|err| Error::Default("nsx.endpoints".into(), err))?
            .set_default("nsx.username", "")
            .map_err(|err| Error::Default("nsx.username".into(), err))?
            .set_default("nsx.password", "")
            .map_err(|err| Error::Default("nsx.password".into(), err))?;

        Ok(builder.add_source(Environment::with_prefix(
            &env!("CARGO_PKG_NAME").replace('-', "_"),
        )))
    }

    pub fn try_default() -> Result<Self, Error> {
        Self::builder()?
            .add_source(
                File::from(PathBuf::from(format!(
                    "/etc/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// Prints a message about missing value for configuration key
    pub fn help(&self) {
        if self.nsx.endpoints.is_empty() {
            warn!("Configuration key 'nsx.endpoints' has an empty value");
        }

        if self.nsx.username.is_empty() {
            warn!("Configuration key 'nsx.username' has an empty value");
        }

        if self.nsx.password.is_empty() {
            warn!("Configuration key 'nsx.password' has an empty value");
        }
    }
}

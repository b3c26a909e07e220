//! # Custom resource definition module
//!
//! This module provides custom resource module command line interface function
//! implementation

use std::sync::Arc;

use kube::CustomResourceExt;

use crate::svc::{
    cfg::Configuration,
    crd::{
        binding_map::SubnetConnectionBindingMap, ip_allocation::IPAddressAllocation,
        network_config::VPCNetworkConfiguration, network_info::NetworkInfo,
        security_policy::SecurityPolicy, subnet::Subnet, subnet_port::SubnetPort,
        subnet_set::SubnetSet,
    },
};

// -----------------------------------------------------------------------------
// CustomResourceDefinitionError enum

#[derive(thiserror::Error, Debug)]
pub enum CustomResourceDefinitionError {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// view function

pub async fn view(_config: Arc<Configuration>) -> Result<(), CustomResourceDefinitionError> {
    let crds = vec![
        serde_yaml::to_string(&VPCNetworkConfiguration::crd())
            .map_err(CustomResourceDefinitionError::Serialize)?,
        serde_yaml::to_string(&NetworkInfo::crd())
            .map_err(CustomResourceDefinitionError::Serialize)?,
        serde_yaml::to_string(&Subnet::crd()).map_err(CustomResourceDefinitionError::Serialize)?,
        serde_yaml::to_string(&SubnetSet::crd())
            .map_err(CustomResourceDefinitionError::Serialize)?,
        serde_yaml::to_string(&SubnetPort::crd())
            .map_err(CustomResourceDefinitionError::Serialize)?,
        serde_yaml::to_string(&SubnetConnectionBindingMap::crd())
            .map_err(CustomResourceDefinitionError::Serialize)?,
        serde_yaml::to_string(&SecurityPolicy::crd())
            .map_err(CustomResourceDefinitionError::Serialize)?,
        serde_yaml::to_string(&IPAddressAllocation::crd())
            .map_err(CustomResourceDefinitionError::Serialize)?,
    ];

    print!("{}", crds.join("\n"));
    Ok(())
}

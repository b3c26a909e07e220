//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{io, path::PathBuf, process::abort, sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use k8s_openapi::api::core::v1::Namespace;
use kube::{api::ListParams, Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use crate::{
    cmd::crd::CustomResourceDefinitionError,
    svc::{
        cfg::Configuration,
        crd::{
            binding_map::{self, SubnetConnectionBindingMap, TargetKind, TargetMapper},
            ip_allocation::{self, IPAddressAllocation},
            network_config::{self, VPCNetworkConfiguration},
            security_policy::{self, SecurityPolicy},
            subnet::{self, Subnet},
            subnet_port::{self, SubnetPort},
            subnet_set::{self, SubnetSet},
        },
        k8s::{
            client,
            controller::{Controller, IdentityMapper},
            inventory,
            lease::Elector,
            namespace::{self, ConfigMapper, NamespaceMapper},
            webhook, State,
        },
        nsx::{
            self,
            client::{Client, HyperTransport},
            gc::{CleanupContext, Collector, LiveSet},
            policy::{GroupCleanup, PolicyCleanup, PolicyService},
            subnet::{BindingCleanup, PortCleanup, SubnetCleanup, SubnetService},
            vpc::{
                DlbCleanup, InventoryCleanup, IpAllocationCleanup, IpAllocationService, VpcCleanup,
                VpcService,
            },
        },
        telemetry::{self, metrics::HEALTH_STATUS},
    },
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// CommandError enum

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(CustomResourceDefinitionError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Print the custom resource definitions managed by the operator
    #[command(name = "custom-resource-definition", aliases = ["crd"])]
    CustomResourceDefinition,
}

#[async_trait]
impl Executor for Command {
    type Error = CommandError;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition => crd::view(config)
                .await
                .map_err(CommandError::CustomResourceDefinition),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version)]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to handle termintion signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to create fabric client, {0}")]
    Fabric(nsx::Error),
    #[error("failed to run leader election, {0}")]
    Lease(crate::svc::k8s::lease::Error),
    #[error("failed to serve admission webhook, {0}")]
    Webhook(webhook::Error),
}

// -----------------------------------------------------------------------------
// Helper functions

/// build the fabric client from the configuration
pub fn fabric_client(config: &Configuration) -> Result<Client, nsx::Error> {
    let transport = Arc::new(HyperTransport::try_new(config.nsx.ca_file.as_deref())?);

    Ok(Client::new(
        transport,
        config.nsx.endpoints.to_owned(),
        &config.nsx.username,
        &config.nsx.password,
        &config.cluster.name,
    )?
    .with_timeout(Duration::from_secs(config.nsx.timeout)))
}

/// register every cleanup plugin against a fresh collector
pub fn collector(client: &Client) -> Collector {
    let mut collector = Collector::new();

    collector
        .register(Arc::new(DlbCleanup {
            client: client.to_owned(),
        }))
        .register(Arc::new(InventoryCleanup {
            client: client.to_owned(),
        }))
        .register(Arc::new(SubnetCleanup {
            service: SubnetService::new(client.to_owned()),
        }))
        .register(Arc::new(PortCleanup {
            client: client.to_owned(),
        }))
        .register(Arc::new(BindingCleanup {
            client: client.to_owned(),
        }))
        .register(Arc::new(PolicyCleanup {
            service: PolicyService::new(client.to_owned()),
        }))
        .register(Arc::new(GroupCleanup {
            client: client.to_owned(),
        }))
        .register(Arc::new(IpAllocationCleanup {
            service: IpAllocationService::new(client.to_owned()),
        }))
        .register(Arc::new(VpcCleanup {
            service: VpcService::new(client.to_owned()),
        }));

    collector
}

async fn collect_uids<T>(kube: &kube::Client, live: &mut LiveSet, created_for: &str)
where
    T: Resource<DynamicType = ()> + ResourceExt + Clone + DeserializeOwned + std::fmt::Debug,
{
    match Api::<T>::all(kube.to_owned()).list(&ListParams::default()).await {
        Ok(items) => {
            for item in items {
                if let Some(uid) = item.uid() {
                    live.insert(created_for, &uid);
                }
            }
        }
        Err(err) => {
            warn!(
                created_for = created_for,
                error = err.to_string(),
                "Failed to list resources for the live set, keeping their fabric objects"
            );
        }
    }
}

/// the set of custom resource uids currently alive, fabric objects tagged
/// with anything else are garbage
pub async fn live_set(kube: &kube::Client) -> LiveSet {
    let mut live = LiveSet::default();

    collect_uids::<Namespace>(kube, &mut live, namespace::CREATED_FOR).await;
    collect_uids::<Subnet>(kube, &mut live, subnet::CREATED_FOR).await;
    collect_uids::<SubnetSet>(kube, &mut live, subnet_set::CREATED_FOR).await;
    collect_uids::<SubnetPort>(kube, &mut live, subnet_port::CREATED_FOR).await;
    collect_uids::<SubnetConnectionBindingMap>(kube, &mut live, binding_map::CREATED_FOR).await;
    collect_uids::<SecurityPolicy>(kube, &mut live, security_policy::CREATED_FOR).await;
    collect_uids::<IPAddressAllocation>(kube, &mut live, ip_allocation::CREATED_FOR).await;

    live
}

/// periodic garbage collection, also the health probe of the fabric
pub async fn gc_loop(state: Arc<State>, collector: Arc<Collector>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match state.nsx.node_version().await {
            Ok(_) => HEALTH_STATUS.set(1),
            Err(err) => {
                HEALTH_STATUS.set(0);
                warn!(error = err.to_string(), "Fabric is unreachable, skipping collection");
                continue;
            }
        }

        let ctx = CleanupContext {
            nsx: state.nsx.to_owned(),
            cluster: state.cluster().to_string(),
            live: live_set(&state.kube).await,
        };

        if let Err(err) = collector.collect(&ctx).await {
            warn!(error = err.to_string(), "Garbage collection completed with errors");
        }
    }
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), DaemonError> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig)
        .await
        .map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Create the fabric client and refuse to run below the supported version
    let nsx_client = fabric_client(&config).map_err(DaemonError::Fabric)?;
    let version = nsx_client.node_version().await.map_err(DaemonError::Fabric)?;
    nsx::check_version(&version).map_err(DaemonError::Fabric)?;
    info!(version = &version, "Fabric version accepted");

    // -------------------------------------------------------------------------
    // Block until this instance holds the lease, then keep renewing it
    let identity = hostname::get()
        .map(|host| host.to_string_lossy().to_string())
        .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string());

    let elector = Arc::new(Elector::new(
        kube_client.to_owned(),
        &config.operator.lease_namespace,
        &config.operator.lease_name,
        &identity,
    ));

    elector.acquire().await.map_err(DaemonError::Lease)?;
    let lease_keeper = {
        let elector = elector.to_owned();
        tokio::spawn(async move {
            if let Err(err) = elector.keep().await {
                error!(error = err.to_string(), "Lost leadership, aborting");
                abort();
            }
        })
    };

    // -------------------------------------------------------------------------
    // Create state to give to each reconciler and mirror the fabric
    let state = State::new(kube_client.to_owned(), nsx_client.to_owned(), config.to_owned());

    if let Err(err) = state.vpcs.populate().await {
        warn!(error = err.to_string(), "Failed to populate vpc store, lazy fallback");
    }
    if let Err(err) = state.subnets.populate().await {
        warn!(error = err.to_string(), "Failed to populate subnet store, lazy fallback");
    }
    if let Err(err) = state.policies.populate().await {
        warn!(error = err.to_string(), "Failed to populate policy store, lazy fallback");
    }
    if let Err(err) = state.binding_maps.populate().await {
        warn!(error = err.to_string(), "Failed to populate binding map store, lazy fallback");
    }
    if let Err(err) = state.allocations.populate().await {
        warn!(error = err.to_string(), "Failed to populate allocation store, lazy fallback");
    }

    HEALTH_STATUS.set(1);

    // -------------------------------------------------------------------------
    // Create controllers and their watch sources
    let workers = config.operator.workers;
    let watch = kube::runtime::watcher::Config::default();

    let mut namespaces = Controller::new(namespace::Reconciler::default(), state.to_owned(), workers);
    namespaces
        .watch(Api::<Namespace>::all(kube_client.to_owned()), watch.to_owned(), NamespaceMapper)
        .watch(
            Api::<VPCNetworkConfiguration>::all(kube_client.to_owned()),
            watch.to_owned(),
            ConfigMapper,
        );

    let mut configs = Controller::new(network_config::Reconciler::default(), state.to_owned(), workers);
    configs.watch(
        Api::<VPCNetworkConfiguration>::all(kube_client.to_owned()),
        watch.to_owned(),
        IdentityMapper,
    );

    let mut subnets = Controller::new(subnet::Reconciler::default(), state.to_owned(), workers);
    subnets
        .watch(Api::<Subnet>::all(kube_client.to_owned()), watch.to_owned(), IdentityMapper)
        .watch(
            Api::<SubnetConnectionBindingMap>::all(kube_client.to_owned()),
            watch.to_owned(),
            TargetMapper::new(TargetKind::Subnets),
        );

    let mut subnet_sets = Controller::new(subnet_set::Reconciler::default(), state.to_owned(), workers);
    subnet_sets
        .watch(Api::<SubnetSet>::all(kube_client.to_owned()), watch.to_owned(), IdentityMapper)
        .watch(
            Api::<Namespace>::all(kube_client.to_owned()),
            watch.to_owned(),
            subnet_set::NamespaceMapper,
        )
        .watch(
            Api::<SubnetConnectionBindingMap>::all(kube_client.to_owned()),
            watch.to_owned(),
            TargetMapper::new(TargetKind::SubnetSets),
        );

    let mut subnet_ports = Controller::new(subnet_port::Reconciler::default(), state.to_owned(), workers);
    subnet_ports.watch(
        Api::<SubnetPort>::all(kube_client.to_owned()),
        watch.to_owned(),
        IdentityMapper,
    );

    let mut binding_maps = Controller::new(binding_map::Reconciler::default(), state.to_owned(), workers);
    binding_maps.watch(
        Api::<SubnetConnectionBindingMap>::all(kube_client.to_owned()),
        watch.to_owned(),
        IdentityMapper,
    );

    let mut policies = Controller::new(security_policy::Reconciler::default(), state.to_owned(), workers);
    policies.watch(
        Api::<SecurityPolicy>::all(kube_client.to_owned()),
        watch.to_owned(),
        IdentityMapper,
    );

    let mut allocations = Controller::new(ip_allocation::Reconciler::default(), state.to_owned(), workers);
    allocations.watch(
        Api::<IPAddressAllocation>::all(kube_client.to_owned()),
        watch,
        IdentityMapper,
    );

    let handles = vec![
        namespaces.run(),
        configs.run(),
        subnets.run(),
        subnet_sets.run(),
        subnet_ports.run(),
        binding_maps.run(),
        policies.run(),
        allocations.run(),
    ];

    // -------------------------------------------------------------------------
    // Create background tasks, garbage collection, inventory sync, webhook
    // and the health server
    let gc = tokio::spawn(gc_loop(
        state.to_owned(),
        Arc::new(collector(&nsx_client)),
        Duration::from_secs(config.operator.gc_period),
    ));

    let inventory = tokio::spawn(inventory::run(state.to_owned(), inventory::SYNC_PERIOD));

    let webhook_task = if config.operator.webhook_cert.is_some() {
        let config = config.to_owned();
        Some(tokio::spawn(async move {
            if let Err(err) = webhook::serve(config).await {
                error!(error = err.to_string(), "Could not serve admission webhook");
                abort();
            }
        }))
    } else {
        warn!("No webhook certificate configured, namespace admission is not guarded");
        None
    };

    let server = {
        let config = config.to_owned();
        tokio::spawn(async move {
            if let Err(err) = telemetry::serve(config).await {
                error!(error = err.to_string(), "Could not serve http server");
                abort();
            }
        })
    };

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c().await.map_err(DaemonError::SigTerm)?;
    info!("Received termination signal, draining controllers");

    // -------------------------------------------------------------------------
    // Drain controllers, in-flight reconciles complete before workers exit
    for handle in &handles {
        handle.shutdown();
    }

    for handle in handles {
        handle.join().await;
    }

    // -------------------------------------------------------------------------
    // Cancel background tasks
    for task in [Some(gc), Some(inventory), webhook_task, Some(server), Some(lease_keeper)]
        .into_iter()
        .flatten()
    {
        task.abort();
        if let Err(err) = task.await {
            if !err.is_cancelled() {
                error!(error = err.to_string(), "Could not wait for the task to complete");
            }
        }
    }

    Ok(())
}

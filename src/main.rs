//! # Nsx vpc operator
//!
//! A kubernetes operator that realizes VPC network custom resources as
//! concrete objects in an NSX fabric

use std::{convert::TryFrom, sync::Arc};

use clap::Parser;
use tracing::{error, info};

use nsx_vpc_operator::{
    cmd::{daemon, Args, CommandError, DaemonError, Executor},
    logging,
    svc::cfg::Configuration,
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command, {0}")]
    Command(CommandError),
    #[error("failed to execute daemon, {0}")]
    Daemon(DaemonError),
    #[error("failed to initialize logging system, {0}")]
    Logging(logging::Error),
    #[error("failed to load configuration, {0}")]
    Configuration(nsx_vpc_operator::svc::cfg::Error),
}

impl From<CommandError> for Error {
    fn from(err: CommandError) -> Self {
        Self::Command(err)
    }
}

impl From<DaemonError> for Error {
    fn from(err: DaemonError) -> Self {
        Self::Daemon(err)
    }
}

impl From<logging::Error> for Error {
    fn from(err: logging::Error) -> Self {
        Self::Logging(err)
    }
}

impl From<nsx_vpc_operator::svc::cfg::Error> for Error {
    fn from(err: nsx_vpc_operator::svc::cfg::Error) -> Self {
        Self::Configuration(err)
    }
}

// -----------------------------------------------------------------------------
// main entrypoint

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    let config = Arc::new(match &args.config {
        Some(path) => Configuration::try_from(path.to_owned())?,
        None => Configuration::try_default()?,
    });

    logging::initialize(args.verbosity as usize, config.debug)?;
    config.help();

    if args.check {
        println!("{} configuration is healthy!", env!("CARGO_PKG_NAME"));
        return Ok(());
    }

    let result = match &args.command {
        Some(cmd) => cmd.execute(config).await.map_err(Error::Command),
        None => daemon(args.kubeconfig, config).await.map_err(Error::Daemon),
    };

    if let Err(err) = result {
        error!(
            error = err.to_string(),
            "could not execute {} properly",
            env!("CARGO_PKG_NAME"),
        );

        return Err(err);
    }

    info!("{} halted!", env!("CARGO_PKG_NAME"));
    Ok(())
}

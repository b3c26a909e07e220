//! # Services module
//!
//! This module provide services to interact with kubernetes, the nsx fabric
//! and helpers to do so.

pub mod cfg;
pub mod crd;
pub mod k8s;
pub mod nsx;
pub mod telemetry;

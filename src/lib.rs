//! # Nsx vpc operator
//!
//! A kubernetes operator that realizes VPC network custom resources as
//! concrete objects in an NSX fabric and keeps both sides convergent

pub mod cmd;
pub mod logging;
pub mod svc;

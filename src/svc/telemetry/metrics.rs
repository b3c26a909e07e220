//! # Metrics module
//!
//! This module expose metrics integrations, structures and helpers

use std::sync::LazyLock;

use hyper::{
    header::{self, HeaderValue, InvalidHeaderValue},
    Body, Request, Response, StatusCode,
};
use prometheus::{
    gather, opts, register_counter_vec, register_int_gauge, CounterVec, Encoder, IntGauge,
    TextEncoder,
};

// -----------------------------------------------------------------------------
// Telemetry

pub static CONTROLLER_SYNC_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!("controller_sync_total", "number of reconciliations per resource type"),
        &["res_type"]
    )
    .expect("metrics 'controller_sync_total' to not be already initialized")
});

pub static CONTROLLER_UPDATE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!("controller_update_total", "number of update operations per resource type"),
        &["res_type"]
    )
    .expect("metrics 'controller_update_total' to not be already initialized")
});

pub static CONTROLLER_UPDATE_SUCCESS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "controller_update_success_total",
            "number of successful update operations per resource type"
        ),
        &["res_type"]
    )
    .expect("metrics 'controller_update_success_total' to not be already initialized")
});

pub static CONTROLLER_UPDATE_FAIL_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "controller_update_fail_total",
            "number of failed update operations per resource type"
        ),
        &["res_type"]
    )
    .expect("metrics 'controller_update_fail_total' to not be already initialized")
});

pub static CONTROLLER_DELETE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!("controller_delete_total", "number of delete operations per resource type"),
        &["res_type"]
    )
    .expect("metrics 'controller_delete_total' to not be already initialized")
});

pub static CONTROLLER_DELETE_SUCCESS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "controller_delete_success_total",
            "number of successful delete operations per resource type"
        ),
        &["res_type"]
    )
    .expect("metrics 'controller_delete_success_total' to not be already initialized")
});

pub static CONTROLLER_DELETE_FAIL_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "controller_delete_fail_total",
            "number of failed delete operations per resource type"
        ),
        &["res_type"]
    )
    .expect("metrics 'controller_delete_fail_total' to not be already initialized")
});

/// 1 while the fabric is reachable and the operator holds the lease
pub static HEALTH_STATUS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("health_status", "health of the operator")
        .expect("metrics 'health_status' to not be already initialized")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize metrics, {0}")]
    PrometheusSerialize(prometheus::Error),
    #[error("failed to parse header value given by prometheus, {0}")]
    PrometheusInvalidHeader(InvalidHeaderValue),
}

// -----------------------------------------------------------------------------
// Helper methods

/// returns in the [`Response`] object the encoded metrics gathered from the
/// application
pub async fn handler(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    // -------------------------------------------------------------------------
    // Step 1: gather and encode metrics

    let families = gather();
    let encoder = TextEncoder;
    let mut buf = vec![];
    encoder
        .encode(&families, &mut buf)
        .map_err(Error::PrometheusSerialize)?;

    // -------------------------------------------------------------------------
    // Step 2: awnser with encoded metrics

    let mut res = Response::default();

    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(encoder.format_type()).map_err(Error::PrometheusInvalidHeader)?,
    );

    *res.status_mut() = StatusCode::OK;
    *res.body_mut() = Body::from(buf);

    Ok(res)
}

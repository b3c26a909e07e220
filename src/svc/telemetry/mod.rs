//! # Telemetry module
//!
//! This module expose telemetry measurements mainly metrics through
//! structures, enums and helpers, and serves them together with the
//! operator's readiness

use std::{collections::BTreeMap, net::AddrParseError, sync::Arc, sync::LazyLock, time::Instant};

use hyper::{
    header::{self, HeaderValue},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::{info, Instrument};

use crate::svc::cfg::Configuration;

pub mod metrics;

// -----------------------------------------------------------------------------
// Telemetry

static SERVER_REQUEST_SUCCESS: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request_success",
            "number of successful request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'kubernetes_operator_server_request_success' to not be already registered")
});

static SERVER_REQUEST_FAILURE: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request_failure",
            "number of failed request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'kubernetes_operator_server_request_failure' to not be already registered")
});

static SERVER_REQUEST_DURATION: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request_duration",
            "duration of request handled by the server",
        ),
        &["method", "path", "status", "unit"]
    )
    .expect("metrics 'kubernetes_operator_server_request_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Metrics(metrics::Error),
    #[error("failed to serialize payload, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to parse listen address '{0}', {1}")]
    Listen(String, AddrParseError),
    #[error("failed to bind server, {0}")]
    Bind(hyper::Error),
    #[error("failed to serve content, {0}")]
    Serve(hyper::Error),
}

// -----------------------------------------------------------------------------
// Helper methods

pub async fn router(req: Request<Body>) -> Result<Response<Body>, Error> {
    let begin = Instant::now();

    // -------------------------------------------------------------------------
    // Basic routing
    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => healthz(&req).await,
        (&Method::GET, "/metrics") => metrics::handler(&req).await.map_err(Error::Metrics),
        _ => not_found(&req).await,
    };

    let duration = Instant::now().duration_since(begin).as_micros();

    // -------------------------------------------------------------------------
    // recover error
    match result {
        Ok(res) => {
            info!(
                method = req.method().as_str(),
                path = req.uri().path(),
                status = res.status().as_u16(),
                duration = format!("{duration}us"),
                "receive request",
            );

            SERVER_REQUEST_SUCCESS
                .with_label_values(&[
                    req.method().as_str(),
                    req.uri().path(),
                    &res.status().as_u16().to_string(),
                ])
                .inc();

            SERVER_REQUEST_DURATION
                .with_label_values(&[
                    req.method().as_str(),
                    req.uri().path(),
                    &res.status().as_u16().to_string(),
                    "us",
                ])
                .inc_by(duration as f64);

            Ok(res)
        }
        Err(err) => {
            // -----------------------------------------------------------------
            // Format error in a convenient way

            let mut map = BTreeMap::new();

            map.insert("error".to_string(), err.to_string());

            // -----------------------------------------------------------------
            // Serialize and send error

            let mut res = Response::default();

            res.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );

            // easter egg
            *res.status_mut() = StatusCode::IM_A_TEAPOT;
            *res.body_mut() =
                Body::from(serde_json::to_string_pretty(&map).map_err(Error::Serialize)?);

            info!(
                method = req.method().as_str(),
                path = req.uri().path(),
                status = res.status().as_u16(),
                duration = format!("{duration}us"),
                "receive request",
            );

            SERVER_REQUEST_FAILURE
                .with_label_values(&[
                    req.method().as_str(),
                    req.uri().path(),
                    &res.status().as_u16().to_string(),
                ])
                .inc();

            SERVER_REQUEST_DURATION
                .with_label_values(&[
                    req.method().as_str(),
                    req.uri().path(),
                    &res.status().as_u16().to_string(),
                    "us",
                ])
                .inc_by(duration as f64);

            Ok(res)
        }
    }
}

/// readiness follows the health gauge, 0 until the version gate passed and
/// the lease is held, 0 again when the fabric stops answering the collector
pub async fn healthz(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let mut res = Response::default();

    *res.status_mut() = if metrics::HEALTH_STATUS.get() > 0 {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok(res)
}

pub async fn not_found(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;

    Ok(res)
}

// -----------------------------------------------------------------------------
// Server

/// serve readiness and metrics on the operator's listen address
pub async fn serve(config: Arc<Configuration>) -> Result<(), Error> {
    let addr = config
        .operator
        .listen
        .parse()
        .map_err(|err| Error::Listen(config.operator.listen.to_owned(), err))?;

    info!("Start to listen for http request on {}", addr);
    Server::try_bind(&addr)
        .map_err(Error::Bind)?
        .serve(make_service_fn(|_| async {
            Ok::<_, Error>(service_fn(router))
        }))
        .instrument(tracing::info_span!("telemetry::serve"))
        .await
        .map_err(Error::Serve)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_should_follow_the_health_gauge() {
        metrics::HEALTH_STATUS.set(0);
        let res = healthz(&Request::default()).await.expect("healthz to answer");
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        metrics::HEALTH_STATUS.set(1);
        let res = healthz(&Request::default()).await.expect("healthz to answer");
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }
}

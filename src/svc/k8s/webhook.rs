//! # Webhook module
//!
//! This module provide the namespace admission validator, the binding
//! annotation is immutable once set unless the operator itself writes it

use std::{net::AddrParseError, path::Path, sync::Arc};

use hyper::{
    body,
    server::conn::Http,
    service::service_fn,
    Body, Method, Request, Response, StatusCode,
};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    ResourceExt,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::svc::{cfg::Configuration, crd::ANNOTATION_NETWORK_CONFIG};

// -----------------------------------------------------------------------------
// Constants

pub const VALIDATE_PATH: &str = "/validate-v1-namespace";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse listen address '{0}', {1}")]
    Listen(String, AddrParseError),
    #[error("failed to bind webhook listener, {0}")]
    Bind(std::io::Error),
    #[error("failed to read webhook certificate material, {0}")]
    Certificate(std::io::Error),
    #[error("failed to build tls configuration, {0}")]
    Tls(rustls::Error),
    #[error("webhook requires 'operator.webhookCert' and 'operator.webhookKey'")]
    MissingCertificate,
}

// -----------------------------------------------------------------------------
// Validation

/// admission decision for one namespace review, creates pass, updates may
/// neither remove nor change the binding annotation once set
pub fn validate(req: &AdmissionRequest<Namespace>, operator_account: &str) -> Result<(), String> {
    if req.operation != Operation::Update {
        return Ok(());
    }

    // the operator itself may rewrite the binding
    if req.user_info.username.as_deref() == Some(operator_account) {
        return Ok(());
    }

    let Some(old) = req
        .old_object
        .as_ref()
        .and_then(|namespace| namespace.annotations().get(ANNOTATION_NETWORK_CONFIG))
    else {
        return Ok(());
    };

    let name = req
        .old_object
        .as_ref()
        .map(|namespace| namespace.name_any())
        .unwrap_or_else(|| req.name.to_owned());

    match req
        .object
        .as_ref()
        .and_then(|namespace| namespace.annotations().get(ANNOTATION_NETWORK_CONFIG))
    {
        None => Err(format!(
            "Namespace {name}: annotation {ANNOTATION_NETWORK_CONFIG} cannot be removed once set"
        )),
        Some(new) if new != old => Err(format!(
            "Namespace {name}: annotation {ANNOTATION_NETWORK_CONFIG} cannot be changed once set"
        )),
        Some(_) => Ok(()),
    }
}

// -----------------------------------------------------------------------------
// Handler

async fn review(req: Request<Body>, config: Arc<Configuration>) -> Response<Body> {
    if req.method() != Method::POST || req.uri().path() != VALIDATE_PATH {
        let mut res = Response::default();
        *res.status_mut() = StatusCode::NOT_FOUND;
        return res;
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = err.to_string(), "Failed to read admission review body");
            let mut res = Response::default();
            *res.status_mut() = StatusCode::BAD_REQUEST;
            return res;
        }
    };

    // decode failures answer 400
    let admission: Result<AdmissionRequest<Namespace>, String> =
        serde_json::from_slice::<AdmissionReview<Namespace>>(&bytes)
            .map_err(|err| err.to_string())
            .and_then(|review| review.try_into().map_err(|err: kube::core::admission::ConvertAdmissionReviewError| err.to_string()));

    let admission = match admission {
        Ok(admission) => admission,
        Err(err) => {
            warn!(error = err, "Received malformed admission review");
            let mut res = Response::default();
            *res.status_mut() = StatusCode::BAD_REQUEST;
            return res;
        }
    };

    let mut response = AdmissionResponse::from(&admission);
    if let Err(message) = validate(&admission, &config.operator.service_account) {
        info!(namespace = &admission.name, message = &message, "Deny namespace admission");
        response = response.deny(message);
    }

    match serde_json::to_vec(&response.into_review()) {
        Ok(payload) => Response::new(Body::from(payload)),
        Err(err) => {
            warn!(error = err.to_string(), "Failed to serialize admission response");
            let mut res = Response::default();
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            res
        }
    }
}

// -----------------------------------------------------------------------------
// Server

fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, Error> {
    let cert_pem = std::fs::read(cert).map_err(Error::Certificate)?;
    let key_pem = std::fs::read(key).map_err(Error::Certificate)?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .map_err(Error::Certificate)?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let key = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice())
        .map_err(Error::Certificate)?
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or(Error::MissingCertificate)?;

    let tls = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(Error::Tls)?;

    Ok(TlsAcceptor::from(Arc::new(tls)))
}

/// serve the admission endpoint over tls until the task is aborted
pub async fn serve(config: Arc<Configuration>) -> Result<(), Error> {
    let (cert, key) = match (&config.operator.webhook_cert, &config.operator.webhook_key) {
        (Some(cert), Some(key)) => (cert.to_owned(), key.to_owned()),
        _ => return Err(Error::MissingCertificate),
    };

    let addr: std::net::SocketAddr = config
        .operator
        .webhook_listen
        .parse()
        .map_err(|err| Error::Listen(config.operator.webhook_listen.to_owned(), err))?;

    let acceptor = tls_acceptor(&cert, &key)?;
    let listener = TcpListener::bind(addr).await.map_err(Error::Bind)?;

    info!("Start to listen for admission reviews on {}", addr);
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = err.to_string(), "Failed to accept webhook connection");
                continue;
            }
        };

        let acceptor = acceptor.to_owned();
        let config = config.to_owned();

        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(
                        remote = remote.to_string(),
                        error = err.to_string(),
                        "Failed to terminate tls on webhook connection"
                    );
                    return;
                }
            };

            let service = service_fn(move |req| {
                let config = config.to_owned();
                async move { Ok::<_, std::convert::Infallible>(review(req, config).await) }
            });

            if let Err(err) = Http::new().serve_connection(stream, service).await {
                warn!(error = err.to_string(), "Failed to serve webhook connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use kube::core::admission::AdmissionReview;

    use super::*;

    const OPERATOR: &str = "system:serviceaccount:vmware-system-nsx:nsx-vpc-operator";

    fn request(
        operation: &str,
        user: &str,
        old: Option<&str>,
        new: Option<&str>,
    ) -> AdmissionRequest<Namespace> {
        let namespace = |annotation: Option<&str>| {
            annotation.map(|value| {
                serde_json::json!({
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": {
                        "name": "ns-b",
                        "annotations": { ANNOTATION_NETWORK_CONFIG: value },
                    },
                })
            })
        };

        // absent annotation still needs an object for UPDATE reviews
        let object = |annotation: Option<&str>| match namespace(annotation) {
            Some(value) => value,
            None => serde_json::json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": "ns-b" },
            }),
        };

        let review: AdmissionReview<Namespace> = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Namespace"},
                "resource": {"group": "", "version": "v1", "resource": "namespaces"},
                "name": "ns-b",
                "operation": operation,
                "userInfo": {"username": user},
                "object": object(new),
                "oldObject": if operation == "UPDATE" { object(old) } else { serde_json::Value::Null },
            },
        }))
        .expect("review to deserialize");

        review.try_into().expect("review to convert")
    }

    #[test]
    fn create_should_be_allowed_unconditionally() {
        let req = request("CREATE", "alice", None, Some("foo"));

        assert!(validate(&req, OPERATOR).is_ok());
    }

    #[test]
    fn removal_should_be_denied_with_the_documented_message() {
        let req = request("UPDATE", "alice", Some("foo"), None);

        assert_eq!(
            validate(&req, OPERATOR).expect_err("removal to be denied"),
            "Namespace ns-b: annotation nsx.vmware.com/vpc_network_config cannot be removed once set"
        );
    }

    #[test]
    fn change_should_be_denied() {
        let req = request("UPDATE", "alice", Some("foo"), Some("bar"));

        assert!(validate(&req, OPERATOR).is_err());
    }

    #[test]
    fn unchanged_annotation_should_be_allowed() {
        let req = request("UPDATE", "alice", Some("foo"), Some("foo"));

        assert!(validate(&req, OPERATOR).is_ok());
    }

    #[test]
    fn first_set_should_be_allowed() {
        let req = request("UPDATE", "alice", None, Some("foo"));

        assert!(validate(&req, OPERATOR).is_ok());
    }

    #[test]
    fn operator_account_should_bypass_the_check() {
        let req = request("UPDATE", OPERATOR, Some("foo"), None);

        assert!(validate(&req, OPERATOR).is_ok());
    }
}

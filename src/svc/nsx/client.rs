//! # Client module
//!
//! This module provide the http client used to interact with the fabric
//! policy api, the transport is pluggable so tests can substitute it

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use hyper::{
    body,
    client::HttpConnector,
    header::{self, HeaderValue},
    Body, Method, Request, Response, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, trace, warn};

use crate::svc::nsx::{
    model::{NodeVersion, OrgRoot},
    Error, REQUEST_TIMEOUT,
};

// -----------------------------------------------------------------------------
// Constants

pub const POLICY_BASE: &str = "/policy/api/v1";
pub const NODE_VERSION: &str = "/api/v1/node/version";

// -----------------------------------------------------------------------------
// Transport trait

/// the wire seam of the fabric client, implementations carry authentication
/// material and tls configuration
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, req: Request<Body>) -> Result<Response<Body>, hyper::Error>;
}

// -----------------------------------------------------------------------------
// HyperTransport structure

pub struct HyperTransport {
    inner: hyper::Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>,
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        self.inner.request(req).await
    }
}

impl HyperTransport {
    /// build a tls transport trusting either the given certificate authority
    /// file or the native roots
    pub fn try_new(ca_file: Option<&Path>) -> Result<Self, Error> {
        let builder = hyper_rustls::HttpsConnectorBuilder::new();
        let connector = match ca_file {
            Some(path) => {
                let pem = std::fs::read(path).map_err(Error::CertificateAuthority)?;
                let mut roots = rustls::RootCertStore::empty();
                for der in rustls_pemfile::certs(&mut pem.as_slice())
                    .map_err(Error::CertificateAuthority)?
                {
                    roots
                        .add(&rustls::Certificate(der))
                        .map_err(|err| Error::CertificateAuthority(std::io::Error::other(err)))?;
                }

                let config = rustls::ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(roots)
                    .with_no_client_auth();

                builder
                    .with_tls_config(config)
                    .https_only()
                    .enable_http1()
                    .enable_http2()
                    .build()
            }
            None => builder
                .with_native_roots()
                .https_only()
                .enable_http1()
                .enable_http2()
                .build(),
        };

        Ok(Self {
            inner: hyper::Client::builder().build(connector),
        })
    }
}

// -----------------------------------------------------------------------------
// Client structure

#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    endpoints: Arc<Vec<String>>,
    authorization: Option<HeaderValue>,
    cluster: String,
    timeout: Duration,
}

impl Client {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoints: Vec<String>,
        username: &str,
        password: &str,
        cluster: &str,
    ) -> Result<Self, Error> {
        if endpoints.is_empty() {
            return Err(Error::NoEndpoint);
        }

        let endpoints = endpoints
            .into_iter()
            .map(|endpoint| {
                if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.trim_end_matches('/').to_string()
                } else {
                    format!("https://{}", endpoint.trim_end_matches('/'))
                }
            })
            .collect();

        let authorization = if username.is_empty() {
            None
        } else {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));

            Some(
                HeaderValue::from_str(&format!("Basic {encoded}"))
                    .map_err(|err| Error::Request(err.into()))?,
            )
        };

        Ok(Self {
            transport,
            endpoints: Arc::new(endpoints),
            authorization,
            cluster: cluster.to_string(),
            timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// execute the request against the configured endpoints, failing over to
    /// the next endpoint on transient results only
    async fn execute(
        &self,
        method: Method,
        path: &str,
        payload: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Vec<u8>), Error> {
        let mut last = Error::NoEndpoint;

        for endpoint in self.endpoints.iter() {
            let uri = format!("{endpoint}{path}");
            let mut builder = Request::builder()
                .method(method.to_owned())
                .uri(&uri)
                .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

            if let Some(authorization) = &self.authorization {
                builder = builder.header(header::AUTHORIZATION, authorization.to_owned());
            }

            let req = builder
                .body(match &payload {
                    Some(bytes) => Body::from(bytes.to_owned()),
                    None => Body::empty(),
                })
                .map_err(Error::Request)?;

            trace!(method = method.as_str(), uri = &uri, "Execute request on the fabric");
            let err = match tokio::time::timeout(self.timeout, self.transport.send(req)).await {
                Err(_) => Error::Timeout(self.timeout),
                Ok(Err(err)) => Error::Http(err),
                Ok(Ok(res)) => {
                    let status = res.status();
                    let bytes = body::to_bytes(res.into_body())
                        .await
                        .map_err(Error::Http)?
                        .to_vec();

                    if status.is_success() {
                        return Ok((status, bytes));
                    }

                    Error::Status {
                        status: status.as_u16(),
                        body: String::from_utf8_lossy(&bytes).to_string(),
                    }
                }
            };

            if !err.is_transient() {
                return Err(err);
            }

            warn!(
                endpoint = endpoint,
                error = err.to_string(),
                "Fabric endpoint answered with a transient error, failing over"
            );

            last = err;
        }

        Err(last)
    }

    pub async fn get<R>(&self, path: &str) -> Result<R, Error>
    where
        R: DeserializeOwned,
    {
        let (_, bytes) = self.execute(Method::GET, path, None).await?;

        serde_json::from_slice(&bytes).map_err(Error::Deserialize)
    }

    /// like [`Client::get`], but absent objects map to `None`
    pub async fn get_opt<R>(&self, path: &str) -> Result<Option<R>, Error>
    where
        R: DeserializeOwned,
    {
        match self.get(path).await {
            Ok(object) => Ok(Some(object)),
            Err(Error::Status { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn put<B, R>(&self, path: &str, object: &B) -> Result<R, Error>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(object).map_err(Error::Serialize)?;
        let (_, bytes) = self.execute(Method::PUT, path, Some(payload)).await?;

        serde_json::from_slice(&bytes).map_err(Error::Deserialize)
    }

    pub async fn patch<B>(&self, path: &str, object: &B) -> Result<(), Error>
    where
        B: Serialize + Sync,
    {
        let payload = serde_json::to_vec(object).map_err(Error::Serialize)?;
        self.execute(Method::PATCH, path, Some(payload)).await?;

        Ok(())
    }

    /// delete the object at the given path, an absent object is a success
    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        match self.execute(Method::DELETE, path, None).await {
            Ok(_) | Err(Error::Status { status: 404, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// hand an intended-children tree to the fabric's hierarchical api, the
    /// fabric reconciles it atomically
    pub async fn apply_tree(&self, org: &str, root: &OrgRoot) -> Result<(), Error> {
        debug!(org = org, children = root.children.len(), "Apply hierarchical patch on the fabric");
        self.patch(&format!("{POLICY_BASE}/orgs/{org}"), root).await
    }

    /// returns the fabric's node version used by the startup gate
    pub async fn node_version(&self) -> Result<String, Error> {
        let version: NodeVersion = self.get(NODE_VERSION).await?;

        Ok(version.node_version)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    // a scripted transport answering each request with the next canned
    // response, used across the nsx module's tests
    pub(crate) struct Script {
        pub responses: Mutex<Vec<(u16, String)>>,
        pub seen: Mutex<Vec<(String, String)>>,
    }

    impl Script {
        pub fn new(responses: Vec<(u16, &str)>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .rev()
                        .map(|(status, body)| (status, body.to_string()))
                        .collect(),
                ),
                seen: Mutex::new(vec![]),
            })
        }
    }

    #[async_trait]
    impl Transport for Script {
        async fn send(&self, req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
            self.seen
                .lock()
                .expect("seen mutex to be healthy")
                .push((req.method().to_string(), req.uri().to_string()));

            let (status, body) = self
                .responses
                .lock()
                .expect("responses mutex to be healthy")
                .pop()
                .unwrap_or((200, "{}".to_string()));

            Ok(Response::builder()
                .status(status)
                .body(Body::from(body))
                .expect("response to build"))
        }
    }

    fn client(script: Arc<Script>) -> Client {
        Client::new(
            script,
            vec!["mgr-1".to_string(), "mgr-2".to_string()],
            "admin",
            "password",
            "cluster-1",
        )
        .expect("client to build")
    }

    #[tokio::test]
    async fn endpoints_should_gain_scheme() {
        let script = Script::new(vec![(200, r#"{"node_version":"4.1.2"}"#)]);
        let version = client(script.to_owned())
            .node_version()
            .await
            .expect("version to be fetched");

        assert_eq!(version, "4.1.2");
        assert_eq!(
            script.seen.lock().expect("seen mutex to be healthy")[0].1,
            "https://mgr-1/api/v1/node/version"
        );
    }

    #[tokio::test]
    async fn transient_errors_should_fail_over() {
        let script = Script::new(vec![(503, "{}"), (200, r#"{"node_version":"4.1.2"}"#)]);
        let version = client(script.to_owned())
            .node_version()
            .await
            .expect("version to be fetched");

        assert_eq!(version, "4.1.2");
        assert_eq!(script.seen.lock().expect("seen mutex to be healthy").len(), 2);
    }

    #[tokio::test]
    async fn terminal_errors_should_not_fail_over() {
        let script = Script::new(vec![(403, "{}"), (200, "{}")]);
        let result = client(script.to_owned()).node_version().await;

        assert!(matches!(result, Err(Error::Status { status: 403, .. })));
        assert_eq!(script.seen.lock().expect("seen mutex to be healthy").len(), 1);
    }

    #[tokio::test]
    async fn delete_should_treat_not_found_as_success() {
        let script = Script::new(vec![(404, "{}")]);

        client(script)
            .delete("/policy/api/v1/orgs/default/projects/p/vpcs/v/subnets/s")
            .await
            .expect("delete to succeed");
    }
}

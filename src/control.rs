use crate::model::{
    ActivityReportRequest, DesiredIdentity, Envelope, HeartbeatRequest, NodeConfig,
    NodeConfigData, TrafficReportRequest, UserSyncData,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::HeaderValue;
use reqwest::{Method, StatusCode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{RootCertStore, SignatureScheme};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("controller request {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("controller returned {status} for {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: StatusCode,
        body: String,
    },
    #[error("controller response for {endpoint} could not be decoded: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("controller rejected {endpoint}: {message}")]
    Rejected { endpoint: String, message: String },
}

impl ControlError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ControlError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The five controller calls the agent depends on.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn fetch_node_config(&self, node_id: u64) -> Result<NodeConfig, ControlError>;

    async fn fetch_desired_users(&self, node_id: u64)
        -> Result<Vec<DesiredIdentity>, ControlError>;

    async fn send_heartbeat(&self, request: &HeartbeatRequest) -> Result<(), ControlError>;

    async fn send_traffic_report(&self, request: &TrafficReportRequest)
        -> Result<(), ControlError>;

    async fn send_activity_report(
        &self,
        request: &ActivityReportRequest,
    ) -> Result<(), ControlError>;
}

pub struct ControlClient {
    base_url: String,
    api_key: Option<HeaderValue>,
    client: reqwest::Client,
}

impl ControlClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        tls_pin: Option<String>,
    ) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("no controller URL configured"));
        }
        let api_key = if api_key.is_empty() {
            None
        } else {
            let mut value = HeaderValue::from_str(api_key)
                .map_err(|_| anyhow!("controller api key contains invalid characters"))?;
            value.set_sensitive(true);
            Some(value)
        };
        Ok(Self {
            base_url,
            api_key,
            client: build_http_client(tls_pin, timeout)?,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/node-agent{}", self.base_url, path)
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<Option<T>, ControlError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let endpoint = self.endpoint(path);
        let mut request = self.client.request(method, &endpoint);
        if let Some(key) = self.api_key.as_ref() {
            request = request.header(API_KEY_HEADER, key.clone());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| ControlError::Transport {
            endpoint: endpoint.clone(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlError::Status {
                endpoint,
                status,
                body: body.trim().to_string(),
            });
        }

        let envelope: Envelope<T> = response.json().await.map_err(|source| ControlError::Decode {
            endpoint: endpoint.clone(),
            source,
        })?;
        if !envelope.success {
            let message = envelope
                .error
                .or(envelope.message)
                .unwrap_or_else(|| "request not successful".to_string());
            return Err(ControlError::Rejected { endpoint, message });
        }
        Ok(envelope.data)
    }

    async fn post<B>(&self, path: &str, body: &B) -> Result<(), ControlError>
    where
        B: Serialize + Sync,
    {
        self.send::<B, serde_json::Value>(Method::POST, path, Some(body))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Controller for ControlClient {
    async fn fetch_node_config(&self, node_id: u64) -> Result<NodeConfig, ControlError> {
        let path = format!("/{}/config", node_id);
        let data: Option<NodeConfigData> = self.send::<(), _>(Method::GET, &path, None).await?;
        data.map(|data| data.node).ok_or_else(|| ControlError::Rejected {
            endpoint: self.endpoint(&path),
            message: "response carried no node configuration".to_string(),
        })
    }

    async fn fetch_desired_users(
        &self,
        node_id: u64,
    ) -> Result<Vec<DesiredIdentity>, ControlError> {
        let path = format!("/{}/sync", node_id);
        let data: Option<UserSyncData> = self.send::<(), _>(Method::GET, &path, None).await?;
        Ok(data
            .unwrap_or_default()
            .users
            .into_iter()
            .map(DesiredIdentity::from)
            .collect())
    }

    async fn send_heartbeat(&self, request: &HeartbeatRequest) -> Result<(), ControlError> {
        self.post("/heartbeat", request).await
    }

    async fn send_traffic_report(
        &self,
        request: &TrafficReportRequest,
    ) -> Result<(), ControlError> {
        self.post("/traffic", request).await
    }

    async fn send_activity_report(
        &self,
        request: &ActivityReportRequest,
    ) -> Result<(), ControlError> {
        self.post("/activity", request).await
    }
}

#[derive(Debug)]
struct PinnedServerCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pin: Vec<u8>,
}

impl ServerCertVerifier for PinnedServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        let digest = Sha256::digest(end_entity.as_ref());
        if digest.as_slice() != self.pin.as_slice() {
            return Err(rustls::Error::General(
                "controller tls pin mismatch".to_string(),
            ));
        }
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn build_http_client(tls_pin: Option<String>, timeout: Duration) -> Result<reqwest::Client> {
    let builder = reqwest::Client::builder().timeout(timeout);
    let Some(pin) = tls_pin else {
        return Ok(builder.build()?);
    };
    let expected = decode_pin(&pin)?;
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let verifier = WebPkiServerVerifier::builder(Arc::new(roots.clone()))
        .build()
        .map_err(|err| anyhow!("failed to build tls verifier: {}", err))?;
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(PinnedServerCertVerifier {
            inner: verifier,
            pin: expected,
        }));
    Ok(builder.use_preconfigured_tls(config).build()?)
}

fn decode_pin(pin: &str) -> Result<Vec<u8>> {
    let normalized: String = pin
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != ':')
        .collect();
    let bytes = hex::decode(normalized).map_err(|_| anyhow!("invalid tls pin hex"))?;
    if bytes.len() != 32 {
        return Err(anyhow!("tls pin must be 32 bytes (sha256)"));
    }
    Ok(bytes)
}

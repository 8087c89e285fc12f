// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client for the agent protocol.
//!
//! Used by controllers to drive an agent. Every request envelope carries a
//! freshly signed bearer token (see [`crate::token`]).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::agent_proto::{RpcRequest, RpcResponse, rpc_request, rpc_response};
use crate::frame::{FrameError, FramedStream};
use crate::token;

/// Errors that can occur in the QUIC client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no connection established")]
    NotConnected,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("empty response envelope")]
    EmptyResponse,

    #[error("agent error {code}: {message}")]
    Agent { code: String, message: String },
}

/// Configuration for the QUIC client
#[derive(Debug, Clone)]
pub struct AgentClientConfig {
    /// Agent address to connect to
    pub server_addr: SocketAddr,
    /// Server name for TLS verification
    pub server_name: String,
    /// Extra root CA bundle (PEM); appended to the webpki roots
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate chain + key (PEM) for mutual TLS
    pub client_cert_pem: Option<(Vec<u8>, Vec<u8>)>,
    /// Skip certificate verification (tests only)
    pub dangerous_skip_cert_verification: bool,
    /// Sign key used to sign request tokens
    pub sign_key: String,
    /// Auth key embedded in request tokens
    pub auth_key: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:5454".parse().unwrap(),
            server_name: "localhost".to_string(),
            ca_pem: None,
            client_cert_pem: None,
            dangerous_skip_cert_verification: false,
            sign_key: String::new(),
            auth_key: String::new(),
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 120_000,
        }
    }
}

/// QUIC client for driving a rangelab agent
pub struct AgentClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    config: AgentClientConfig,
}

impl AgentClient {
    /// Create a new client with the given configuration
    pub fn new(config: AgentClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())?;
        endpoint.set_default_client_config(Self::build_client_config(&config)?);

        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            config,
        })
    }

    /// Create a client for a local agent with certificate verification
    /// disabled; keys are still required for request tokens
    pub fn localhost(sign_key: &str, auth_key: &str) -> Result<Self, ClientError> {
        Self::new(AgentClientConfig {
            dangerous_skip_cert_verification: true,
            sign_key: sign_key.to_string(),
            auth_key: auth_key.to_string(),
            ..Default::default()
        })
    }

    fn build_client_config(config: &AgentClientConfig) -> Result<ClientConfig, ClientError> {
        let builder = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new()))
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            if let Some(ca_pem) = &config.ca_pem {
                for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
                    let cert =
                        cert.map_err(|e| ClientError::Tls(format!("failed to parse CA: {}", e)))?;
                    roots
                        .add(cert)
                        .map_err(|e| ClientError::Tls(e.to_string()))?;
                }
            }
            rustls::ClientConfig::builder().with_root_certificates(roots)
        };

        let crypto = match &config.client_cert_pem {
            Some((cert_pem, key_pem)) => {
                let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ClientError::Tls(format!("failed to parse cert: {}", e)))?;
                let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                    .map_err(|e| ClientError::Tls(format!("failed to parse key: {}", e)))?
                    .ok_or_else(|| ClientError::Tls("no private key found".to_string()))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| ClientError::Tls(e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .map_err(|_| ClientError::Tls("idle timeout out of range".to_string()))?,
        ));

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| ClientError::Tls(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Connect to the agent, reusing a live connection if one exists
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut conn_guard = self.connection.lock().await;

        if let Some(ref conn) = *conn_guard
            && conn.close_reason().is_none()
        {
            debug!("reusing existing connection");
            return Ok(());
        }

        info!(addr = %self.config.server_addr, "connecting to agent");

        let connecting = self
            .endpoint
            .connect(self.config.server_addr, &self.config.server_name)?;
        let connection = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            connecting,
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        *conn_guard = Some(connection);
        Ok(())
    }

    async fn get_connection(&self) -> Result<Connection, ClientError> {
        self.connect().await?;
        let conn_guard = self.connection.lock().await;
        conn_guard.clone().ok_or(ClientError::NotConnected)
    }

    /// Open a new bidirectional stream
    pub async fn open_stream(
        &self,
    ) -> Result<FramedStream<(quinn::SendStream, quinn::RecvStream)>, ClientError> {
        let conn = self.get_connection().await?;
        let (send, recv) = conn.open_bi().await?;
        Ok(FramedStream::new((send, recv)))
    }

    /// Wrap an inner request into a signed envelope
    pub fn envelope(&self, request: rpc_request::Request) -> RpcRequest {
        RpcRequest {
            token: token::sign(&self.config.sign_key, &self.config.auth_key),
            request: Some(request),
        }
    }

    /// Issue a single RPC on a fresh stream
    pub async fn call(
        &self,
        request: rpc_request::Request,
    ) -> Result<rpc_response::Response, ClientError> {
        let envelope = self.envelope(request);
        let mut stream = self.open_stream().await?;
        let response: RpcResponse = stream.request(&envelope).await?;

        match response.response {
            Some(rpc_response::Response::Error(e)) => Err(ClientError::Agent {
                code: e.code,
                message: e.message,
            }),
            Some(resp) => Ok(resp),
            None => Err(ClientError::EmptyResponse),
        }
    }

    /// Liveness probe
    pub async fn ping(&self) -> Result<(), ClientError> {
        match self
            .call(rpc_request::Request::Ping(crate::agent_proto::PingRequest {}))
            .await?
        {
            rpc_response::Response::Ping(_) => Ok(()),
            _ => Err(ClientError::EmptyResponse),
        }
    }

    /// Open the monitoring stream. The returned stream answers every
    /// monitoring prompt sent with [`FramedStream::request`].
    pub async fn monitoring(
        &self,
    ) -> Result<FramedStream<(quinn::SendStream, quinn::RecvStream)>, ClientError> {
        self.open_stream().await
    }

    /// Close the client endpoint
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"client closing");
    }
}

/// Certificate verifier that accepts any server certificate. Development
/// and test use only.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Self {
        Self(Arc::new(rustls::crypto::ring::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the collector endpoint.

use std::fs;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Certificate, Client, Identity, StatusCode};

use super::ShipError;
use crate::config::{Config, TlsConfig};

/// Transport timeout of one POST.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a POST that got an answer other than 200, or no answer at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostFailure {
    /// `None` when the request never got a response.
    pub status: Option<u16>,
    pub message: String,
}

/// HTTP client bound to one collector endpoint.
#[derive(Debug, Clone)]
pub struct CollectorClient {
    client: Client,
    endpoint: String,
    headers: HeaderMap,
}

impl CollectorClient {
    /// Builds the client from the TLS and auth settings in `config`. Fails
    /// when a configured certificate or key cannot be read.
    pub fn new(endpoint: &str, config: &Config) -> Result<Self, ShipError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        if let Some(token) = config.auth_token.as_deref().filter(|t| !t.is_empty()) {
            let name = HeaderName::from_bytes(config.auth_header.trim().as_bytes())
                .map_err(|e| ShipError::Client(format!("invalid auth header name: {e}")))?;
            let value = HeaderValue::from_str(token)
                .map_err(|e| ShipError::Client(format!("invalid auth token: {e}")))?;
            headers.insert(name, value);
        }

        Ok(Self {
            client: build_client(&config.tls)?,
            endpoint: endpoint.to_string(),
            headers,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POSTs a gzip'd envelope. Only a 200 counts as delivered.
    pub async fn post(&self, body: Vec<u8>) -> Result<(), PostFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| PostFailure {
                status: None,
                message: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(PostFailure {
            status: Some(status.as_u16()),
            message: format!("status {}: {}", status.as_u16(), text.trim()),
        })
    }
}

fn build_client(tls: &TlsConfig) -> Result<Client, ShipError> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .timeout(REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(tls.insecure_skip_verify);

    if let Some(ca_path) = &tls.ca_path {
        let pem = fs::read(ca_path).map_err(|e| {
            ShipError::Client(format!("failed to read CA file {}: {e}", ca_path.display()))
        })?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|e| ShipError::Client(format!("invalid CA file {}: {e}", ca_path.display())))?;
        builder = builder.add_root_certificate(certificate);
    }

    match (&tls.client_cert_path, &tls.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let mut pem = fs::read(cert_path).map_err(|e| {
                ShipError::Client(format!(
                    "failed to read client certificate {}: {e}",
                    cert_path.display()
                ))
            })?;
            pem.push(b'\n');
            pem.extend(fs::read(key_path).map_err(|e| {
                ShipError::Client(format!(
                    "failed to read client key {}: {e}",
                    key_path.display()
                ))
            })?);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| ShipError::Client(format!("invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(ShipError::Client(
                "client_cert_path and client_key_path must be set together".to_string(),
            ))
        }
    }

    builder
        .build()
        .map_err(|e| ShipError::Client(format!("failed to build HTTP client: {e}")))
}

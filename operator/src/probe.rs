// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::time::Duration;

/// Trust anchor and client identity for mutually authenticated probes.
#[derive(Clone)]
pub struct ProbeTls {
    pub ca_cert_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid probe TLS material: {0}")]
    Tls(#[source] reqwest::Error),
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok(false)` when the endpoint is unreachable or reports unhealthy.
    async fn probe(&self, url: &str, tls: &ProbeTls) -> Result<bool, ProbeError>;
}

#[derive(Deserialize)]
struct HealthResponse {
    health: String,
}

fn is_healthy(body: &str) -> bool {
    serde_json::from_str::<HealthResponse>(body).is_ok_and(|r| r.health == "true")
}

pub struct HttpsProbe {
    timeout: Duration,
}

impl HttpsProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self, tls: &ProbeTls) -> Result<reqwest::Client, ProbeError> {
        let ca = reqwest::Certificate::from_pem(tls.ca_cert_pem.as_bytes()).map_err(ProbeError::Tls)?;
        let identity_pem = format!("{}\n{}", tls.client_cert_pem, tls.client_key_pem);
        let identity = reqwest::Identity::from_pem(identity_pem.as_bytes()).map_err(ProbeError::Tls)?;
        reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(self.timeout)
            .build()
            .map_err(ProbeError::Tls)
    }
}

#[async_trait]
impl HealthProbe for HttpsProbe {
    async fn probe(&self, url: &str, tls: &ProbeTls) -> Result<bool, ProbeError> {
        let client = self.client(tls)?;
        let response = match client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("probe of {url} failed: {e}");
                return Ok(false);
            }
        };
        if !response.status().is_success() {
            debug!("probe of {url} returned {}", response.status());
            return Ok(false);
        }
        Ok(response.text().await.is_ok_and(|body| is_healthy(&body)))
    }
}

use super::{AccessPointClient, DeliveryReceipt, Submission};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// JSON gateway client for the tax authority's record registration service.
#[derive(Clone)]
pub struct AeatClient {
    pub base_url: String,
    pub auth: AeatAuth,
    http_client: reqwest::Client,
    access_token: Arc<RwLock<Option<String>>>,
}

#[derive(Clone)]
pub enum AeatAuth {
    ApiKey {
        key: String,
    },
    OAuth2 {
        client_id: String,
        client_secret: String,
        token_url: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    record_type: &'a str,
    invoice_id: &'a str,
    issuer_nif: &'a str,
    record: &'a billchain_core::Rfe,
    prev_hash: &'a str,
    hash: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    /// "Correcto" | "AceptadoConErrores" | "Incorrecto"
    estado: String,
    csv: Option<String>,
    #[serde(rename = "descripcionError")]
    error_description: Option<String>,
}

#[derive(Debug, Serialize)]
struct OAuth2TokenRequest {
    grant_type: String,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct OAuth2TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

impl AeatClient {
    pub fn new(base_url: String, auth: AeatAuth) -> Result<Arc<Self>> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Arc::new(Self {
            base_url,
            auth,
            http_client,
            access_token: Arc::new(RwLock::new(None)),
        }))
    }

    async fn get_auth_header(&self) -> Result<String> {
        match &self.auth {
            AeatAuth::ApiKey { key } => Ok(format!("Bearer {}", key)),
            AeatAuth::OAuth2 {
                client_id,
                client_secret,
                token_url,
            } => {
                {
                    let token_read = self.access_token.read().await;
                    if let Some(t) = token_read.as_ref() {
                        return Ok(format!("Bearer {}", t));
                    }
                }

                let req_body = OAuth2TokenRequest {
                    grant_type: "client_credentials".to_string(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                };

                let resp = self
                    .http_client
                    .post(token_url)
                    .json(&req_body)
                    .send()
                    .await
                    .context("Failed to request OAuth2 token")?;

                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    bail!("OAuth2 token request failed: {} - {}", status, body);
                }

                let token_resp: OAuth2TokenResponse = resp
                    .json()
                    .await
                    .context("Failed to parse token response")?;

                {
                    let mut token_write = self.access_token.write().await;
                    *token_write = Some(token_resp.access_token.clone());
                }

                Ok(format!("Bearer {}", token_resp.access_token))
            }
        }
    }

    async fn clear_cached_token(&self) {
        let mut token_write = self.access_token.write().await;
        *token_write = None;
    }
}

fn receipt_from(resp: RegisterResponse) -> DeliveryReceipt {
    match resp.estado.as_str() {
        "Correcto" | "AceptadoConErrores" => DeliveryReceipt {
            accepted: true,
            transmission_id: resp.csv,
            message: resp.error_description,
        },
        other => DeliveryReceipt {
            accepted: false,
            transmission_id: resp.csv,
            message: Some(
                resp.error_description
                    .unwrap_or_else(|| format!("registration state {other}")),
            ),
        },
    }
}

#[async_trait]
impl AccessPointClient for AeatClient {
    async fn submit(&self, submission: &Submission) -> Result<DeliveryReceipt> {
        let auth_header = self.get_auth_header().await?;
        let submit_url = format!("{}/api/v1/registros", self.base_url);

        let payload = RegisterRequest {
            record_type: submission.record.kind.as_str(),
            invoice_id: &submission.invoice_id,
            issuer_nif: &submission.record.header.issuer.nif,
            record: &submission.record,
            prev_hash: &submission.prev_hash,
            hash: &submission.hash,
        };

        let resp = self
            .http_client
            .post(&submit_url)
            .header("Authorization", auth_header)
            .json(&payload)
            .send()
            .await
            .context("Failed to send record to tax authority")?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.clear_cached_token().await;
            bail!("Tax authority rejected credentials (401)");
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Tax authority submit failed: {} - {}", status, body);
        }

        let register_resp: RegisterResponse = resp
            .json()
            .await
            .context("Failed to parse registration response")?;

        let receipt = receipt_from(register_resp);
        tracing::info!(
            invoice_id = %submission.invoice_id,
            accepted = receipt.accepted,
            csv = ?receipt.transmission_id,
            "Record submitted to tax authority"
        );

        Ok(receipt)
    }
}

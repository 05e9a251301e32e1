use crate::error::ServiceError;
use crate::services::{CredentialMinter, EphemeralSecret, MintRequest, MintResponse, SignalingExchange};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

/// Минтинг эфемерного ключа через HTTP функцию бэкенда
#[derive(Debug, Clone)]
pub struct HttpCredentialMinter {
    client: reqwest::Client,
    url: String,
    access_token: Option<String>,
}

impl HttpCredentialMinter {
    pub fn new(
        url: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            access_token,
        })
    }
}

#[async_trait]
impl CredentialMinter for HttpCredentialMinter {
    async fn mint(&self, request: &MintRequest) -> anyhow::Result<MintResponse> {
        log::info!("Minting ephemeral key for session {}", request.session_id);

        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(ServiceError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Rejected {
                endpoint: "mint",
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let mint: MintResponse = response.json().await.map_err(ServiceError::from)?;
        mint.validate()?;
        Ok(mint)
    }
}

/// Обмен SDP с realtime бэкендом: offer в теле, answer в ответе
#[derive(Debug, Clone)]
pub struct HttpSignaling {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSignaling {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl SignalingExchange for HttpSignaling {
    async fn exchange(
        &self,
        model: &str,
        secret: &EphemeralSecret,
        offer_sdp: &str,
    ) -> anyhow::Result<String> {
        log::debug!("Posting SDP offer ({} bytes) for model {}", offer_sdp.len(), model);

        let response = self
            .client
            .post(&self.base_url)
            .query(&[("model", model)])
            .bearer_auth(secret.expose())
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(ServiceError::from)?;

        let status = response.status();
        let body = response.text().await.map_err(ServiceError::from)?;
        if !status.is_success() {
            return Err(ServiceError::Rejected {
                endpoint: "signaling",
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(body)
    }
}

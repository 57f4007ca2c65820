use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::{Map, Value};

use super::{ConnectorSpec, ConnectorStatus, ControlError};

/// The subset of the control-plane REST API the provisioner needs.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn ping(&self) -> Result<(), ControlError>;
    async fn list(&self) -> Result<Vec<String>, ControlError>;
    /// `None` when the connector does not exist.
    async fn get_config(&self, name: &str) -> Result<Option<Map<String, Value>>, ControlError>;
    async fn create(&self, spec: &ConnectorSpec) -> Result<(), ControlError>;
    async fn update(&self, spec: &ConnectorSpec) -> Result<(), ControlError>;
    /// `None` when the connector does not exist.
    async fn status(&self, name: &str) -> Result<Option<ConnectorStatus>, ControlError>;
    async fn restart(&self, name: &str) -> Result<(), ControlError>;
    /// Deleting a connector that is already gone is not an error.
    async fn delete(&self, name: &str) -> Result<(), ControlError>;
}

#[derive(Clone, Debug)]
pub struct ConnectClient {
    base_url: String,
    client: reqwest::Client,
}

impl ConnectClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ControlError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn connector_url(&self, name: &str, suffix: &str) -> String {
        format!(
            "{}/connectors/{}{}",
            self.base_url,
            urlencoding::encode(name),
            suffix
        )
    }

    /// Send and turn any non-2xx into [`ControlError::Http`]. 404 is passed through
    /// so callers can decide whether "missing" is an error.
    async fn send(&self, req: RequestBuilder) -> Result<Response, ControlError> {
        let resp = req
            .send()
            .await
            .map_err(|e| ControlError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ControlError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn expect_found(&self, resp: Response) -> Result<Response, ControlError> {
        if resp.status() == StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            return Err(ControlError::Http { status: 404, body });
        }
        Ok(resp)
    }
}

#[async_trait]
impl ControlPlane for ConnectClient {
    async fn ping(&self) -> Result<(), ControlError> {
        let resp = self.send(self.client.get(format!("{}/", self.base_url))).await?;
        self.expect_found(resp).await.map(|_| ())
    }

    async fn list(&self) -> Result<Vec<String>, ControlError> {
        let resp = self
            .send(self.client.get(format!("{}/connectors", self.base_url)))
            .await?;
        self.expect_found(resp)
            .await?
            .json::<Vec<String>>()
            .await
            .map_err(|e| ControlError::Decode(e.to_string()))
    }

    async fn get_config(&self, name: &str) -> Result<Option<Map<String, Value>>, ControlError> {
        let resp = self
            .send(self.client.get(self.connector_url(name, "/config")))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        resp.json::<Map<String, Value>>()
            .await
            .map(Some)
            .map_err(|e| ControlError::Decode(e.to_string()))
    }

    async fn create(&self, spec: &ConnectorSpec) -> Result<(), ControlError> {
        let resp = self
            .send(
                self.client
                    .post(format!("{}/connectors", self.base_url))
                    .json(spec),
            )
            .await?;
        self.expect_found(resp).await.map(|_| ())
    }

    async fn update(&self, spec: &ConnectorSpec) -> Result<(), ControlError> {
        let resp = self
            .send(
                self.client
                    .put(self.connector_url(&spec.name, "/config"))
                    .json(&spec.config),
            )
            .await?;
        self.expect_found(resp).await.map(|_| ())
    }

    async fn status(&self, name: &str) -> Result<Option<ConnectorStatus>, ControlError> {
        let resp = self
            .send(self.client.get(self.connector_url(name, "/status")))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        resp.json::<ConnectorStatus>()
            .await
            .map(Some)
            .map_err(|e| ControlError::Decode(e.to_string()))
    }

    async fn restart(&self, name: &str) -> Result<(), ControlError> {
        let resp = self
            .send(self.client.post(self.connector_url(name, "/restart")))
            .await?;
        self.expect_found(resp).await.map(|_| ())
    }

    async fn delete(&self, name: &str) -> Result<(), ControlError> {
        self.send(self.client.delete(self.connector_url(name, "")))
            .await
            .map(|_| ())
    }
}

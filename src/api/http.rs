//! JSON-over-HTTP implementation of the management API

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::config::ApiConfig;
use crate::error::{Error, Result};

use super::{
    Api, ClientInfo, DetectResult, DetectRule, NodeInfo, NodeStatus, NodeType, OnlineUser,
    UserInfo, UserTraffic,
};

/// Panel client. Every call is a single request with a bearer key; the
/// controller owns retries via its periodic ticks.
pub struct HttpApi {
    client: Client,
    base_url: Url,
    key: String,
    node_id: u32,
    node_type: NodeType,
}

impl HttpApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = Url::parse(&config.api_host)
            .map_err(|e| Error::Config(format!("invalid api host: {}", e)))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Api(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            key: config.api_key.clone(),
            node_id: config.node_id,
            node_type: config.node_type,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(&format!("api/v1/node/{}/{}", self.node_id, path))
            .map_err(|e| Error::Api(format!("invalid API path {}: {}", path, e)))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path)?)
            .bearer_auth(&self.key)
            .send()
            .await
            .map_err(|e| Error::Api(format!("GET {}: {}", path, e)))?
            .error_for_status()
            .map_err(|e| Error::Api(format!("GET {}: {}", path, e)))?;
        response
            .json()
            .await
            .map_err(|e| Error::Api(format!("GET {}: bad response: {}", path, e)))
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        self.client
            .post(self.url(path)?)
            .bearer_auth(&self.key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Api(format!("POST {}: {}", path, e)))?
            .error_for_status()
            .map_err(|e| Error::Api(format!("POST {}: {}", path, e)))?;
        Ok(())
    }
}

#[async_trait]
impl Api for HttpApi {
    fn describe(&self) -> ClientInfo {
        ClientInfo {
            api_host: self.base_url.to_string(),
            node_id: self.node_id,
            key: self.key.clone(),
            node_type: self.node_type,
        }
    }

    async fn get_node_info(&self) -> Result<NodeInfo> {
        self.get("info").await
    }

    async fn get_user_list(&self) -> Result<Vec<UserInfo>> {
        self.get("users").await
    }

    async fn get_node_rules(&self) -> Result<Vec<DetectRule>> {
        self.get("rules").await
    }

    async fn report_node_status(&self, status: &NodeStatus) -> Result<()> {
        self.post("status", status).await
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()> {
        self.post("traffic", traffic).await
    }

    async fn report_node_online_users(&self, online: &[OnlineUser]) -> Result<()> {
        self.post("online", online).await
    }

    async fn report_illegal(&self, results: &[DetectResult]) -> Result<()> {
        self.post("illegal", results).await
    }
}

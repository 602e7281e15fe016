/// Chain RPC client - JSON-RPC 2.0 over HTTP(S)
///
/// Two calls are consumed by the sync engine:
/// - `status` for the current chain tip height
/// - `block` for one block (header + embedded transactions) by height
///
/// The client never retries internally; a failed height is picked up again
/// by the next scheduled sync pass.
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{BlockInfo, StatusInfo};

/// Connection establishment timeout (seconds)
const CONNECT_TIMEOUT: u64 = 10;
/// Whole-request timeout (seconds); expiry surfaces as a transport error
const REQUEST_TIMEOUT: u64 = 30;

#[derive(Debug, Error)]
pub enum RpcError {
    /// Transport-layer failure: connect, timeout, or an unreadable body.
    #[error("rpc transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    /// The node answered with a JSON-RPC error payload.
    #[error("rpc node error: {message}")]
    Node { message: String },
    /// The node reported the requested height as absent or skipped.
    #[error("block {height} unavailable: {message}")]
    MissingBlock { height: u64, message: String },
}

impl RpcError {
    /// Transport-class ("system") errors are logged quieter than node
    /// responses; see the sink's drop handling.
    pub fn is_system(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

#[async_trait]
pub trait ChainRpc: Send + Sync + 'static {
    async fn status(&self) -> Result<StatusInfo, RpcError>;
    async fn block(&self, height: u64) -> Result<BlockInfo, RpcError>;
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl RpcErrorBody {
    fn into_message(self) -> String {
        match self.data {
            Some(data) if self.message.is_empty() => data.to_string(),
            Some(data) => format!("{}: {}", self.message, data),
            None => self.message,
        }
    }
}

pub struct NearRpcClient {
    client: reqwest::Client,
    url: String,
}

impl NearRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<RpcEnvelope<T>, RpcError> {
        let envelope = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": "nearscan",
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .json::<RpcEnvelope<T>>()
            .await?;
        Ok(envelope)
    }
}

#[async_trait]
impl ChainRpc for NearRpcClient {
    async fn status(&self) -> Result<StatusInfo, RpcError> {
        let envelope: RpcEnvelope<StatusInfo> = self.call("status", Value::Array(vec![])).await?;
        if let Some(error) = envelope.error {
            return Err(RpcError::Node {
                message: error.into_message(),
            });
        }
        envelope.result.ok_or_else(|| RpcError::Node {
            message: "empty response envelope".to_string(),
        })
    }

    async fn block(&self, height: u64) -> Result<BlockInfo, RpcError> {
        let envelope: RpcEnvelope<BlockInfo> =
            self.call("block", serde_json::json!([height])).await?;
        if let Some(error) = envelope.error {
            return Err(RpcError::MissingBlock {
                height,
                message: error.into_message(),
            });
        }
        envelope.result.ok_or(RpcError::MissingBlock {
            height,
            message: "empty response envelope".to_string(),
        })
    }
}

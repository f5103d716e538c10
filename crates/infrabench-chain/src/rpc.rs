//! HTTP chain client.
//!
//! The chain substrate node exposes a small REST surface for the three
//! reads this validator needs. Wallet handling and weight extrinsics live
//! in the substrate tooling, not here.

use crate::clock::{ChainClient, ChainError};
use async_trait::async_trait;
use infrabench_types::MinerIdentity;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct BlockReply {
    block: u64,
}

#[derive(Debug, Deserialize)]
struct TempoReply {
    tempo: u64,
}

#[derive(Debug, Deserialize)]
struct MetagraphReply {
    miners: Vec<MinerIdentity>,
}

pub struct HttpChainClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChainClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(Self { client, endpoint: endpoint.trim_end_matches('/').to_string() })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ChainError> {
        let url = format!("{}{path}", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ChainError::Rpc(format!("{url} not found")));
        }
        if !status.is_success() {
            return Err(ChainError::Rpc(format!("{url} returned {status}")));
        }
        response.json::<T>().await.map_err(|e| ChainError::Rpc(e.to_string()))
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn current_block(&self) -> Result<u64, ChainError> {
        Ok(self.get_json::<BlockReply>("/chain/block").await?.block)
    }

    async fn tempo(&self, netuid: u16) -> Result<u64, ChainError> {
        Ok(self
            .get_json::<TempoReply>(&format!("/chain/tempo/{netuid}"))
            .await?
            .tempo)
    }

    async fn metagraph(&self, netuid: u16) -> Result<Vec<MinerIdentity>, ChainError> {
        Ok(self
            .get_json::<MetagraphReply>(&format!("/chain/metagraph/{netuid}"))
            .await?
            .miners)
    }
}

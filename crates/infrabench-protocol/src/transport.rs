//! Miner transport: one seam, two implementations.
//!
//! `HttpMinerTransport` posts signed JSON envelopes to the miner's served
//! endpoint. `MockTransport` routes requests to in-process handlers and is
//! the workhorse of the round-orchestration tests.

use crate::envelope::{RequestEnvelope, Signer};
use crate::messages::{MinerReply, MinerRequest, RpcMessage};
use async_trait::async_trait;
use infrabench_types::{MinerIdentity, Uid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),
    #[error("miner returned HTTP {0}")]
    Status(u16),
    #[error("reply decode failed: {0}")]
    Decode(String),
    #[error("no route to uid {0}")]
    NoRoute(Uid),
    #[error("miner answered with the wrong reply kind")]
    WrongReplyKind,
    #[error("envelope error: {0}")]
    Envelope(#[from] crate::envelope::EnvelopeError),
}

/// Sends one typed request to one miner and returns its typed reply.
///
/// Per-call deadlines are enforced by the caller (wrapping timeout) and by
/// the implementation (connection/request timeouts), per the concurrency
/// model: the transport alone is not trusted to give up on time.
#[async_trait]
pub trait MinerTransport: Send + Sync {
    async fn send(
        &self,
        target: &MinerIdentity,
        request: MinerRequest,
    ) -> Result<MinerReply, TransportError>;
}

/// Generic typed send over any request/reply pair.
pub async fn send_typed<M: RpcMessage + Send>(
    transport: &dyn MinerTransport,
    target: &MinerIdentity,
    message: M,
) -> Result<M::Reply, TransportError> {
    let reply = transport.send(target, message.into_request()).await?;
    M::reply_from(reply).ok_or(TransportError::WrongReplyKind)
}

// ============================================================
// HTTP transport
// ============================================================

/// JSON-over-HTTP transport to a miner's served endpoint.
pub struct HttpMinerTransport {
    client: reqwest::Client,
    signer: Signer,
    request_timeout: Duration,
}

impl HttpMinerTransport {
    pub fn new(signer: Signer, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Connect("client".to_string(), e.to_string()))?;
        Ok(Self { client, signer, request_timeout })
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn url(target: &MinerIdentity) -> String {
        format!("http://{}/rpc/v1", target.address())
    }
}

#[async_trait]
impl MinerTransport for HttpMinerTransport {
    async fn send(
        &self,
        target: &MinerIdentity,
        request: MinerRequest,
    ) -> Result<MinerReply, TransportError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let envelope = RequestEnvelope::seal(&self.signer, now, request)?;
        let url = Self::url(target);
        debug!(uid = target.uid, kind = envelope.payload.kind(), %url, "sending miner rpc");

        let response = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(target.address())
                } else {
                    TransportError::Connect(target.address(), e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        response
            .json::<MinerReply>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

// ============================================================
// Mock transport
// ============================================================

type Handler = Arc<dyn Fn(MinerRequest) -> Result<MinerReply, TransportError> + Send + Sync>;

/// In-process transport keyed by uid. Each uid gets a handler closure and
/// an optional artificial latency; every serialized request is recorded so
/// tests can assert on exact wire content.
#[derive(Default)]
pub struct MockTransport {
    handlers: Mutex<HashMap<Uid, Handler>>,
    delays: Mutex<HashMap<Uid, Duration>>,
    sent: Mutex<Vec<(Uid, String)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(&self, uid: Uid, handler: F)
    where
        F: Fn(MinerRequest) -> Result<MinerReply, TransportError> + Send + Sync + 'static,
    {
        self.handlers.lock().insert(uid, Arc::new(handler));
    }

    /// Add artificial latency to every call for `uid`.
    pub fn delay(&self, uid: Uid, delay: Duration) {
        self.delays.lock().insert(uid, delay);
    }

    /// Serialized JSON of every request sent so far, in send order.
    pub fn sent_wire_payloads(&self) -> Vec<(Uid, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MinerTransport for MockTransport {
    async fn send(
        &self,
        target: &MinerIdentity,
        request: MinerRequest,
    ) -> Result<MinerReply, TransportError> {
        let wire = serde_json::to_string(&request)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        self.sent.lock().push((target.uid, wire));

        let delay = self.delays.lock().get(&target.uid).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handler = self.handlers.lock().get(&target.uid).cloned();
        match handler {
            Some(handler) => handler(request),
            None => Err(TransportError::NoRoute(target.uid)),
        }
    }
}

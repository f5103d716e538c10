//! Wire protocol between the validator and its miners.
//!
//! Four typed request/reply pairs travel over a single transport:
//! - `Handshake`: liveness probe before dispatch
//! - `Task`: prompt-only task broadcast, artifact reply
//! - `Feedback`: per-task score after evaluation
//! - `Cleanup`: sandbox verdict echo so miners can free resources
//!
//! Every request is wrapped in a hotkey-signed envelope. The task request
//! deliberately has no way to carry invariants: the prompt and task id are
//! the whole payload.

pub mod envelope;
pub mod messages;
pub mod transport;

pub use envelope::{EnvelopeError, RequestEnvelope, Signer};
pub use messages::{
    CleanupReply, CleanupRequest, FeedbackReply, FeedbackRequest, HandshakeReply,
    HandshakeRequest, MinerReply, MinerRequest, RpcMessage, TaskReply, TaskRequest,
    PROTOCOL_VERSION,
};
pub use transport::{send_typed, HttpMinerTransport, MinerTransport, MockTransport, TransportError};

//! Stratum v1 message types and JSON-RPC serialization.
//!
//! This module defines the wire format for Stratum v1 protocol messages using
//! serde for JSON serialization, plus the parsers that turn pool
//! notifications and responses into typed values.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use bitcoin::block::Version;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Difficulty, Extranonce2};

/// Request id of `mining.subscribe`.
pub const SUBSCRIBE_ID: u64 = 1;

/// Request id of `mining.authorize`.
pub const AUTHORIZE_ID: u64 = 2;

/// First id handed out to submits and pings. Ids below this are reserved for
/// the handshake so a late handshake response can never match a submit.
pub const FIRST_DYNAMIC_ID: u64 = 100;

/// Events emitted by the Stratum client.
///
/// These events are sent via channel to the client consumer
/// to notify about protocol state changes and new work.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// TCP connection established; a new session begins
    Connected { session_id: u64 },

    /// Subscribe response received
    Subscribed {
        session_id: u64,
        /// Extranonce1 value from subscription
        extranonce1: Vec<u8>,
        /// Extranonce2 size in bytes
        extranonce2_size: usize,
    },

    /// Worker authorized; shares may be submitted
    Authorized { session_id: u64 },

    /// New mining job received from pool
    NewJob {
        session_id: u64,
        job: JobNotification,
    },

    /// Difficulty changed
    DifficultyChanged(Difficulty),

    /// Pool replaced extranonce1 and/or the extranonce2 width
    ExtranonceChanged {
        session_id: u64,
        extranonce1: Vec<u8>,
        extranonce2_size: usize,
    },

    /// Share was accepted by pool
    ShareAccepted {
        job_id: String,
        nonce: u32,
        /// Time between sending `mining.submit` and the response
        latency: Duration,
    },

    /// Share was rejected by pool
    ShareRejected { job_id: String, reason: RejectReason },

    /// Session ended; all jobs from it are void
    Disconnected { session_id: u64, reason: String },

    /// Client gave up and will not reconnect
    Fatal(String),
}

/// Commands sent to the Stratum client.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// Submit a share to the pool
    SubmitShare(ShareSubmission),
}

/// A share found by the hash engine, tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareSubmission {
    /// Session the job (and its extranonce1) came from
    pub session_id: u64,
    pub job_id: String,
    pub extranonce2: Extranonce2,
    pub ntime: u32,
    pub nonce: u32,
}

/// Mining job notification from pool (mining.notify).
///
/// This is the core work unit sent by the pool. It contains all the data
/// needed to construct block headers for mining. Uses Rust Bitcoin types
/// for type safety.
#[derive(Debug, Clone, PartialEq)]
pub struct JobNotification {
    /// Unique job identifier
    pub job_id: String,

    /// Previous block hash, already in internal byte order
    pub prev_hash: BlockHash,

    /// First part of coinbase transaction (before extranonce)
    pub coinbase1: Vec<u8>,

    /// Second part of coinbase transaction (after extranonce)
    pub coinbase2: Vec<u8>,

    /// Merkle branch hashes, in the order they must be folded
    pub merkle_branches: Vec<TxMerkleNode>,

    /// Block version field
    pub version: Version,

    /// Encoded network target (nbits)
    pub nbits: CompactTarget,

    /// Block timestamp (Unix epoch seconds)
    pub ntime: u32,

    /// If true, abandon all previous jobs
    pub clean_jobs: bool,
}

impl JobNotification {
    /// Parse from Stratum JSON array parameters.
    ///
    /// Converts hex strings from the pool protocol into typed Bitcoin structures.
    /// Uses manual parsing for better error context than serde tuple structs.
    pub fn from_stratum_params(params: &[Value]) -> Result<Self, String> {
        if params.len() < 9 {
            return Err(format!(
                "mining.notify needs 9 params, got {}",
                params.len()
            ));
        }

        let job_id = params[0].as_str().ok_or("job_id not a string")?.to_string();

        let prev_hash_str = params[1].as_str().ok_or("prev_hash not a string")?;
        let prev_hash = parse_block_hash(prev_hash_str)?;

        let coinbase1_str = params[2].as_str().ok_or("coinbase1 not a string")?;
        let coinbase1 = hex::decode(coinbase1_str).map_err(|e| format!("coinbase1 hex: {}", e))?;

        let coinbase2_str = params[3].as_str().ok_or("coinbase2 not a string")?;
        let coinbase2 = hex::decode(coinbase2_str).map_err(|e| format!("coinbase2 hex: {}", e))?;

        let branches_json = params[4].as_array().ok_or("merkle_branches not an array")?;
        let merkle_branches = branches_json
            .iter()
            .map(|branch| {
                let branch_str = branch.as_str().ok_or("merkle branch not a string")?;
                parse_merkle_node(branch_str)
            })
            .collect::<Result<Vec<_>, String>>()?;

        // version, nbits and ntime are big-endian hex of the u32 value
        let version = Version::from_consensus(parse_hex_u32(&params[5], "version")? as i32);
        let nbits = CompactTarget::from_consensus(parse_hex_u32(&params[6], "nbits")?);
        let ntime = parse_hex_u32(&params[7], "ntime")?;

        let clean_jobs = params[8].as_bool().ok_or("clean_jobs not a bool")?;

        Ok(Self {
            job_id,
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }
}

fn parse_hex_u32(value: &Value, field: &str) -> Result<u32, String> {
    let s = value
        .as_str()
        .ok_or_else(|| format!("{} not a string", field))?;
    u32::from_str_radix(s, 16).map_err(|e| format!("{} hex: {}", field, e))
}

/// Parse a block hash from Stratum hex string.
///
/// Stratum v1 sends the previous block hash as eight 4-byte words, each
/// printed big-endian. Reversing the bytes within every word yields the
/// internal (little-endian) byte order that goes into the header:
///
/// ```text
/// Stratum:  6b6455fd 6db962c1 01f2d4fc 0d67f4a3 ...
/// Internal: fd55646b c162b96d fcd4f201 a3f4670d ...
/// ```
///
/// See <https://github.com/slushpool/stratumprotocol/issues/9>.
fn parse_block_hash(hex: &str) -> Result<BlockHash, String> {
    let mut bytes = hex::decode(hex).map_err(|e| format!("block hash hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("block hash wrong length: {}", bytes.len()));
    }

    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }

    BlockHash::from_slice(&bytes).map_err(|e| format!("block hash parse: {}", e))
}

/// Parse a merkle node from Stratum hex string.
///
/// Branches are sent in internal byte order and used as-is.
fn parse_merkle_node(hex: &str) -> Result<TxMerkleNode, String> {
    let bytes = hex::decode(hex).map_err(|e| format!("merkle node hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("merkle node wrong length: {}", bytes.len()));
    }
    TxMerkleNode::from_slice(&bytes).map_err(|e| format!("merkle node parse: {}", e))
}

/// Result of `mining.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResult {
    /// Id of the `mining.notify` subscription, if the pool reported one
    pub subscription_id: Option<String>,
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
}

impl SubscribeResult {
    /// Parse `[subscription_details, extranonce1, extranonce2_size]`.
    ///
    /// `subscription_details` is either a list of `[method, id]` pairs or a
    /// bare `[method, id]` pair; some pools send null.
    pub fn from_result(result: &Value) -> Result<Self, String> {
        let arr = result.as_array().ok_or("subscribe result not an array")?;
        if arr.len() < 3 {
            return Err(format!("subscribe result too short: {}", arr.len()));
        }

        let subscription_id = subscription_id(&arr[0]);

        let extranonce1 = arr[1]
            .as_str()
            .ok_or("extranonce1 not a string")
            .and_then(|s| hex::decode(s).map_err(|_| "extranonce1 not hex"))?;

        let extranonce2_size = parse_extranonce2_size(&arr[2])?;

        Ok(Self {
            subscription_id,
            extranonce1,
            extranonce2_size,
        })
    }
}

fn subscription_id(details: &Value) -> Option<String> {
    let pairs = details.as_array()?;
    let pair_id = |pair: &Value| {
        let pair = pair.as_array()?;
        match (pair.first()?.as_str()?, pair.get(1)?.as_str()) {
            ("mining.notify", Some(id)) => Some(id.to_string()),
            _ => None,
        }
    };

    if pairs.first().is_some_and(Value::is_string) {
        return pair_id(details);
    }
    pairs.iter().find_map(pair_id)
}

/// Any non-zero width parses; whether it can be mined is the client's call.
fn parse_extranonce2_size(value: &Value) -> Result<usize, String> {
    let size = value.as_u64().ok_or("extranonce2_size not an integer")?;
    if size == 0 {
        return Err("extranonce2_size is zero".to_string());
    }
    usize::try_from(size).map_err(|_| format!("extranonce2_size too large: {}", size))
}

/// Parse `mining.set_difficulty` params (`[difficulty]`).
///
/// Integer and fractional values are both accepted; zero, negative and
/// non-numeric values are not.
pub fn parse_set_difficulty(params: &Value) -> Result<Difficulty, String> {
    let value = params
        .as_array()
        .and_then(|a| a.first())
        .and_then(Value::as_f64)
        .ok_or("set_difficulty param not a number")?;
    Difficulty::new(value).ok_or_else(|| format!("invalid difficulty: {}", value))
}

/// Parse `mining.set_extranonce` params (`[extranonce1, extranonce2_size]`).
pub fn parse_set_extranonce(params: &Value) -> Result<(Vec<u8>, usize), String> {
    let arr = params.as_array().ok_or("set_extranonce params not an array")?;
    if arr.len() < 2 {
        return Err("set_extranonce needs 2 params".to_string());
    }
    let extranonce1 = arr[0]
        .as_str()
        .ok_or("extranonce1 not a string")
        .and_then(|s| hex::decode(s).map_err(|_| "extranonce1 not hex"))?;
    let extranonce2_size = parse_extranonce2_size(&arr[1])?;
    Ok((extranonce1, extranonce2_size))
}

/// Parameters for submitting a share to the pool.
#[derive(Debug, Clone)]
pub struct SubmitParams {
    /// Worker name (`user.worker`)
    pub username: String,

    /// Job ID this share is for
    pub job_id: String,

    /// Extranonce2 used
    pub extranonce2: Extranonce2,

    /// Timestamp used (Unix epoch seconds)
    pub ntime: u32,

    /// Nonce found
    pub nonce: u32,
}

impl SubmitParams {
    /// Convert to Stratum hex string format for transmission.
    ///
    /// `[user.worker, job_id, extranonce2_hex, ntime_hex, nonce_hex]`, with
    /// ntime and nonce printed as big-endian hex of their integer values.
    pub fn to_stratum_json(&self) -> Vec<Value> {
        vec![
            Value::String(self.username.clone()),
            Value::String(self.job_id.clone()),
            Value::String(self.extranonce2.to_hex()),
            Value::String(format!("{:08x}", self.ntime)),
            Value::String(format!("{:08x}", self.nonce)),
        ]
    }
}

/// Why the pool rejected a share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Job no longer valid on the pool (code 21)
    Stale,
    /// Share already submitted (code 22)
    Duplicate,
    /// Hash above the pool's share target (code 23)
    LowDifficulty,
    /// Worker not authorized or not subscribed (codes 24, 25)
    Unauthorized,
    /// Pool lost track of this session (code 9250); forces a reconnect
    Unmanaged,
    Other { code: Option<i64>, message: String },
}

/// Error code some pools use for a desynchronized session.
pub const UNMANAGED_ERROR_CODE: i64 = 9250;

impl RejectReason {
    /// Classify a JSON-RPC `error` payload.
    ///
    /// Accepts the usual `[code, message, traceback]` array, an object with
    /// `code`/`message`, or a bare string. The numeric code wins; the message
    /// text is consulted only when the code is unknown or absent.
    pub fn classify(error: &Value) -> Self {
        let (code, message) = match error {
            Value::Array(arr) => (
                arr.first().and_then(Value::as_i64),
                arr.get(1).and_then(Value::as_str).unwrap_or_default(),
            ),
            Value::Object(obj) => (
                obj.get("code").and_then(Value::as_i64),
                obj.get("message").and_then(Value::as_str).unwrap_or_default(),
            ),
            Value::String(s) => (None, s.as_str()),
            _ => (None, ""),
        };

        match code {
            Some(21) => return RejectReason::Stale,
            Some(22) => return RejectReason::Duplicate,
            Some(23) => return RejectReason::LowDifficulty,
            Some(24) | Some(25) => return RejectReason::Unauthorized,
            Some(UNMANAGED_ERROR_CODE) => return RejectReason::Unmanaged,
            _ => {}
        }

        let lower = message.to_ascii_lowercase();
        if lower.contains("unmanaged") {
            RejectReason::Unmanaged
        } else if lower.contains("stale") || lower.contains("job not found") {
            RejectReason::Stale
        } else if lower.contains("duplicate") {
            RejectReason::Duplicate
        } else if lower.contains("low difficulty") || lower.contains("above target") {
            RejectReason::LowDifficulty
        } else if lower.contains("unauthorized") || lower.contains("not subscribed") {
            RejectReason::Unauthorized
        } else {
            RejectReason::Other {
                code,
                message: message.to_string(),
            }
        }
    }

    /// Whether this rejection should force a reconnect cycle.
    pub fn is_unmanaged(&self) -> bool {
        matches!(self, RejectReason::Unmanaged)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Stale => f.write_str("stale job"),
            RejectReason::Duplicate => f.write_str("duplicate share"),
            RejectReason::LowDifficulty => f.write_str("low difficulty"),
            RejectReason::Unauthorized => f.write_str("unauthorized worker"),
            RejectReason::Unmanaged => f.write_str("session unmanaged"),
            RejectReason::Other {
                code: Some(code),
                message,
            } => write!(f, "{} ({})", message, code),
            RejectReason::Other { code: None, message } => f.write_str(message),
        }
    }
}

/// Lifecycle of a submitted share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareStatus {
    Pending,
    Accepted,
    Rejected(RejectReason),
}

/// A share awaiting the pool's verdict, keyed by its request id.
#[derive(Debug, Clone)]
pub struct PendingShare {
    pub job_id: String,
    pub extranonce2: Extranonce2,
    pub ntime: u32,
    pub nonce: u32,
    /// JSON-RPC id of the `mining.submit` request
    pub correlation_id: u64,
    pub status: ShareStatus,
    pub sent_at: Instant,
}

impl PendingShare {
    /// Record the pool's verdict. Terminal: a resolved share stays resolved.
    pub fn resolve(&mut self, status: ShareStatus) {
        if self.status == ShareStatus::Pending {
            self.status = status;
        }
    }
}

/// Per-client share counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareStats {
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Shares found but dropped because their session had ended
    pub discarded: u64,
}

/// JSON-RPC message envelope.
///
/// Stratum uses a simplified JSON-RPC format where messages can be:
/// - Requests (have method and params, may have id)
/// - Responses (have id and result or error)
/// - Notifications (have method and params, no id)
///
/// Stratum v1 predates JSON-RPC 2.0: notifications carry `id: null`, errors
/// are arrays rather than objects, and there is no version field. A small
/// custom type fits these quirks without adapter layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification from client or server
    Request {
        /// Message ID (null for notifications)
        id: Option<u64>,
        /// Method name (e.g., "mining.notify", "mining.subscribe")
        method: String,
        /// Method parameters
        params: Value,
    },

    /// Response to a request
    Response {
        /// Message ID matching the request
        id: u64,
        /// Result value (present on success)
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error value (present on failure)
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    /// Create a new request message.
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Create a notification (request without ID).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Create a response; test pools use this to answer the client.
    pub fn response(id: u64, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error_response(id: u64, error: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Get the message ID if present.
    pub fn id(&self) -> Option<u64> {
        match self {
            JsonRpcMessage::Request { id, .. } => *id,
            JsonRpcMessage::Response { id, .. } => Some(*id),
        }
    }

    /// Check if this is a notification (request without ID).
    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Request { id: None, .. })
    }

    /// Get the method name for requests.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Wire opcodes, carried as the integer `op` field of every frame.
///
/// `Ready`, `Apply` and `RequestAllBack` only ever travel server->client;
/// the dispatcher ignores them when a controller sends them anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum OpCode {
    Ready = 0,
    Apply = 1,
    Request = 2,
    RequestAll = 3,
    RequestAllBack = 4,
    Acknowledged = 5,
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(raw: u8) -> Result<Self, ProtocolError> {
        match raw {
            0 => Ok(Self::Ready),
            1 => Ok(Self::Apply),
            2 => Ok(Self::Request),
            3 => Ok(Self::RequestAll),
            4 => Ok(Self::RequestAllBack),
            5 => Ok(Self::Acknowledged),
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode {0}")]
    UnknownOpCode(u8),
    #[error("{0:?} frame is missing its payload")]
    MissingPayload(OpCode),
    #[error("malformed {0:?} payload: {1}")]
    MalformedPayload(OpCode, #[source] serde_json::Error),
}

/// Punishment categories whose expiry the relay delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunishmentKind {
    Ban,
    Mute,
    VoiceBan,
    VoiceMute,
}

/// One scheduled punishment expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    #[serde(rename = "type")]
    pub kind: PunishmentKind,
    pub guild_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderator_id: Option<String>,
    pub issued_at: i64,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Timeout {
    /// Identity key under which the durable record is stored. One guild/user
    /// pair has at most one record, though nothing stops a second timer from
    /// being armed for the same key while the first is still pending.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.guild_id, self.user_id)
    }

    /// Time left until delivery. An expiry already in the past clamps to
    /// zero and delivers immediately rather than being rejected.
    pub fn delivery_delay(&self) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(self.issued_at).max(0) as u64)
    }
}

/// Protocol envelope: `{"op": <int>, "d": <payload>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub op: OpCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
}

impl Frame {
    pub fn ready() -> Self {
        Self {
            op: OpCode::Ready,
            d: None,
        }
    }

    pub fn apply(timeout: &Timeout) -> Self {
        Self {
            op: OpCode::Apply,
            d: encode(timeout),
        }
    }

    pub fn request(timeout: &Timeout) -> Self {
        Self {
            op: OpCode::Request,
            d: encode(timeout),
        }
    }

    pub fn request_all() -> Self {
        Self {
            op: OpCode::RequestAll,
            d: None,
        }
    }

    pub fn request_all_back(records: &std::collections::HashMap<String, Timeout>) -> Self {
        Self {
            op: OpCode::RequestAllBack,
            d: encode(records),
        }
    }

    /// Decodes the payload as a single timeout, validating that required
    /// fields are present and well typed.
    pub fn timeout_payload(&self) -> Result<Timeout, ProtocolError> {
        let payload = self
            .d
            .clone()
            .ok_or(ProtocolError::MissingPayload(self.op))?;
        serde_json::from_value(payload).map_err(|err| ProtocolError::MalformedPayload(self.op, err))
    }

    /// Decodes the payload as a sequence of raw entries. Entries are handed
    /// back undecoded so a bad element can be skipped without aborting the
    /// rest of the batch.
    pub fn batch_payload(&self) -> Result<Vec<Value>, ProtocolError> {
        let payload = self
            .d
            .clone()
            .ok_or(ProtocolError::MissingPayload(self.op))?;
        serde_json::from_value(payload).map_err(|err| ProtocolError::MalformedPayload(self.op, err))
    }
}

fn encode<T: Serialize>(payload: &T) -> Option<Value> {
    match serde_json::to_value(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            error!(error = %err, "unable to encode frame payload");
            None
        }
    }
}

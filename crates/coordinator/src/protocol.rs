//! Wire protocol between followers and the leader
//!
//! One TCP connection per follower carries line-delimited JSON [`Frame`]s in
//! both directions:
//!
//! ```text
//!  follower                                leader
//!     │ ── request {seq, call} ──────────────► │
//!     │ ◄───────────── reply {seq, reply} ──── │
//!     │ ◄──────────────── invoke {token, id} ─ │  (dispatch time)
//!     │ ── invoked {token, outcome} ─────────► │
//!     │ ◄───────────────── discard {token} ─── │  (never to be invoked)
//! ```
//!
//! `seq` pairs a request with its reply; `token` names the callable a
//! follower registered for one submission. Every token the leader accepts
//! ends in exactly one `invoke` or one `discard`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use throttle_dispatch::{DispatchError, Key};
use tokio_util::codec::LinesCodec;

use crate::error::CoordinatorError;

/// Identifier usable across processes
pub trait SharedKey: Key + Serialize + DeserializeOwned {}

impl<T> SharedKey for T where T: Key + Serialize + DeserializeOwned {}

/// Outcome of one execution as reported over the wire
pub type Outcome = Result<(), DispatchError>;

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame<K> {
    /// Follower -> leader
    Request { seq: u64, call: Call<K> },
    /// Leader -> follower, answers the request with the same `seq`
    Reply { seq: u64, reply: Reply },
    /// Leader -> follower: run the callable registered under `token`
    Invoke { token: u64, id: K },
    /// Follower -> leader: the callable for `token` finished
    Invoked { token: u64, outcome: Outcome },
    /// Leader -> follower: the callable for `token` was dropped unrun
    /// (suppressed, replaced by a promotion, or discarded at shutdown)
    Discard { token: u64 },
}

/// Calls a follower makes on the shared dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call<K> {
    Background { id: K, token: u64 },
    Foreground { id: K, token: u64 },
    Idle,
    Wait { timeout_ms: Option<u64> },
    Shutdown,
}

/// Leader replies, one per call kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Submitted { accepted: bool },
    Completed { outcome: Outcome },
    Idle { idle: bool },
    Waited { idle: bool },
    ShutDown,
}

impl<K: SharedKey> Frame<K> {
    /// Encode as one line (without the terminator)
    pub fn encode(&self) -> Result<String, CoordinatorError> {
        serde_json::to_string(self)
            .map_err(|e| CoordinatorError::protocol(format!("failed to encode frame: {e}")))
    }

    /// Decode one line
    pub fn decode(line: &str) -> Result<Self, CoordinatorError> {
        serde_json::from_str(line)
            .map_err(|e| CoordinatorError::protocol(format!("malformed frame: {e}")))
    }
}

/// Line codec bounded to `max_frame_length` bytes per frame
pub fn codec(max_frame_length: usize) -> LinesCodec {
    LinesCodec::new_with_max_length(max_frame_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let frame: Frame<String> = Frame::Request {
            seq: 7,
            call: Call::Background {
                id: "apple".to_string(),
                token: 3,
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "frame": "request",
                "seq": 7,
                "call": {"call": "background", "id": "apple", "token": 3}
            })
        );
    }

    #[test]
    fn test_decodes_unit_calls_and_replies() {
        let frame = Frame::<u32>::decode(r#"{"frame":"request","seq":1,"call":{"call":"idle"}}"#);
        assert_eq!(frame.unwrap(), Frame::Request { seq: 1, call: Call::Idle });

        let frame = Frame::<u32>::decode(r#"{"frame":"reply","seq":1,"reply":{"reply":"shut_down"}}"#);
        assert_eq!(frame.unwrap(), Frame::Reply { seq: 1, reply: Reply::ShutDown });
    }

    #[test]
    fn test_outcome_carries_dispatch_error() {
        let frame: Frame<u32> = Frame::Invoked {
            token: 9,
            outcome: Err(DispatchError::failed("quota exceeded")),
        };
        let line = frame.encode().unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(Frame::<u32>::decode(&line).unwrap(), frame);
    }

    #[test]
    fn test_discard_wire_format() {
        let frame: Frame<u32> = Frame::Discard { token: 12 };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"frame": "discard", "token": 12})
        );
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(matches!(
            Frame::<u32>::decode(r#"{"frame":"launch"}"#),
            Err(CoordinatorError::Protocol(_))
        ));
        assert!(matches!(
            Frame::<u32>::decode("not json"),
            Err(CoordinatorError::Protocol(_))
        ));
    }
}

//! Peer gateway wire protocol
//!
//! Mutating requests that must run on a file's coordinator travel between
//! gateways as length-prefixed messages.

use serde::{Deserialize, Serialize};

/// Protocol message kinds for gateway-to-gateway requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Apply a write on the coordinator
    Write(WriteMsg),
    /// Apply a truncate on the coordinator
    Truncate(TruncateMsg),
    /// Detach (unlink/rmdir) an entry on the coordinator
    Detach(DetachMsg),
    /// Request accepted and applied
    Accepted(AcceptedMsg),
    /// Request failed
    Error(ErrorMsg),
}

/// Remote write request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteMsg {
    pub fs_path: String,
    pub file_version: i64,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Remote truncate request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncateMsg {
    pub fs_path: String,
    pub file_version: i64,
    pub size: u64,
    /// Block versions over the surviving range [start, end)
    pub block_versions: Vec<i64>,
}

/// Remote detach request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachMsg {
    pub fs_path: String,
    pub file_version: i64,
}

/// Positive acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedMsg {
    pub write_nonce: i64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub code: i32,
    pub text: String,
}

/// Serialize a message for transmission
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Deserialize a message from bytes
pub fn decode_message(data: &[u8]) -> Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::Truncate(TruncateMsg {
            fs_path: "/a/b".to_string(),
            file_version: 3,
            size: 6000,
            block_versions: vec![1, 2],
        });

        let wire = encode_message(&msg).unwrap();
        match decode_message(&wire).unwrap() {
            Message::Truncate(t) => {
                assert_eq!(t.fs_path, "/a/b");
                assert_eq!(t.size, 6000);
                assert_eq!(t.block_versions, vec![1, 2]);
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }
}

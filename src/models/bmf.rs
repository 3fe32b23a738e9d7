use crate::error::ParserError;
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Largest payload a single internal record may carry.
pub const BMF_MAX_MSG_LEN: usize = 8192;
/// Fixed-size portion of a serialised record.
pub const BMF_HEADER_LEN: usize = 16;

/// Record types carried through the pipeline. The numbering leaves the
/// low byte range free for wire-protocol codes.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u16)]
pub enum BmfType {
    MsgToPeer = 257,
    MsgFromPeer = 258,
    MsgLabeled = 259,
    TableTransfer = 260,
    SessionStatus = 261,
    QueuesStatus = 262,
    ChainsStatus = 263,
    FsmStateChange = 264,
    BgpmonStart = 265,
    BgpmonStop = 266,
    TableStart = 267,
    TableStop = 268,
    MrtStatus = 277,
}

/// The internal message format exchanged between modules: a timestamped,
/// session-bound envelope around an opaque payload.
///
/// A record placed on a queue is shared behind an `Arc` and stays immutable
/// until every reader has released its slot; all mutation happens before
/// enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bmf {
    pub timestamp: u32,
    pub precision_time: Option<u32>,
    pub session_id: u16,
    pub bmf_type: BmfType,
    payload: BytesMut,
}

impl Bmf {
    /// Create an empty record stamped with the current wall clock.
    pub fn new(session_id: u16, bmf_type: BmfType) -> Bmf {
        let now = chrono::Utc::now();
        Bmf {
            timestamp: now.timestamp() as u32,
            precision_time: Some(now.timestamp_subsec_micros()),
            session_id,
            bmf_type,
            payload: BytesMut::new(),
        }
    }

    /// Create a record carrying a caller-supplied timestamp (MRT ingest
    /// stamps records with the feed's time, not the collector's).
    pub fn with_timestamp(session_id: u16, bmf_type: BmfType, timestamp: u32) -> Bmf {
        Bmf {
            timestamp,
            precision_time: None,
            session_id,
            bmf_type,
            payload: BytesMut::new(),
        }
    }

    /// Append payload bytes, refusing to exceed [`BMF_MAX_MSG_LEN`].
    pub fn append(&mut self, data: &[u8]) -> Result<(), ParserError> {
        if self.payload.len() + data.len() > BMF_MAX_MSG_LEN {
            return Err(ParserError::TruncatedMsg(format!(
                "BMF payload would exceed {} bytes ({} + {})",
                BMF_MAX_MSG_LEN,
                self.payload.len(),
                data.len()
            )));
        }
        self.payload.put_slice(data);
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Payload of an [`BmfType::FsmStateChange`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old_state: u16,
    pub new_state: u16,
    pub reason: u16,
}

impl StateChange {
    pub fn encode(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[0..2].copy_from_slice(&self.old_state.to_be_bytes());
        out[2..4].copy_from_slice(&self.new_state.to_be_bytes());
        out[4..6].copy_from_slice(&self.reason.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<StateChange, ParserError> {
        if data.len() < 6 {
            return Err(ParserError::TruncatedMsg(
                "state change payload shorter than 6 bytes".to_string(),
            ));
        }
        Ok(StateChange {
            old_state: u16::from_be_bytes([data[0], data[1]]),
            new_state: u16::from_be_bytes([data[2], data[3]]),
            reason: u16::from_be_bytes([data[4], data[5]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_respects_cap() {
        let mut bmf = Bmf::new(1, BmfType::MsgFromPeer);
        let chunk = vec![0u8; 4096];
        bmf.append(&chunk).unwrap();
        bmf.append(&chunk).unwrap();
        assert_eq!(bmf.len(), BMF_MAX_MSG_LEN);
        assert!(bmf.append(&[0]).is_err());
        // a failed append leaves the payload untouched
        assert_eq!(bmf.len(), BMF_MAX_MSG_LEN);
    }

    #[test]
    fn test_state_change_roundtrip() {
        let change = StateChange {
            old_state: 5,
            new_state: 6,
            reason: 14,
        };
        let decoded = StateChange::decode(&change.encode()).unwrap();
        assert_eq!(decoded, change);
    }
}

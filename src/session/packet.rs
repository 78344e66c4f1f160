//! Wire format of data messages.
//!
//! Every binary WebSocket message carries one rkyv-serialized [`StreamPacket`].
//! The enum discriminant tells a compressed frame apart from the end-of-stream
//! marker, so no payload bytes can ever be mistaken for the marker.

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::TransportError;

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(compare(PartialEq))]
pub enum StreamPacket {
    /// One compressed frame, exactly one per audio frame.
    Frame(Vec<u8>),
    /// Sent once after the last frame; nothing follows on this connection.
    EndOfStream,
}

impl StreamPacket {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| TransportError::Serialize(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        // Message payloads carry no alignment guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<StreamPacket, rkyv::rancor::Error>(&aligned)
            .map_err(|e| TransportError::Serialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_is_distinct_from_lookalike_payload() {
        let lookalike = StreamPacket::Frame(b"END_OF_STREAM".to_vec());
        let decoded = StreamPacket::from_bytes(&lookalike.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, lookalike);
        assert_ne!(decoded, StreamPacket::EndOfStream);

        let marker = StreamPacket::from_bytes(&StreamPacket::EndOfStream.to_bytes().unwrap());
        assert_eq!(marker.unwrap(), StreamPacket::EndOfStream);
    }

    #[test]
    fn test_frame_payload_survives_unaligned_input() {
        let packet = StreamPacket::Frame((0..=255u8).collect());
        let bytes = packet.to_bytes().unwrap();

        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        assert_eq!(StreamPacket::from_bytes(&shifted[1..]).unwrap(), packet);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(StreamPacket::from_bytes(b"END_OF_STREAM").is_err());
        assert!(StreamPacket::from_bytes(&[]).is_err());
    }
}

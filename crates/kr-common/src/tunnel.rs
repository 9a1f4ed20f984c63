//! Tunnel protocol header codec (§4.8).
//!
//! Every WebSocket frame in the container-tunnel and forward-proxy chains
//! starts with an 8-byte big-endian header followed by a variable-length
//! payload framed by the WebSocket message boundary itself.

use thiserror::Error;

/// Size in bytes of a tunnel header.
pub const HEADER_LEN: usize = 8;

/// Tunnel frame type (header byte 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Connect,
    Connected,
    Data,
    Close,
    Error,
    Ping,
    Pong,
}

impl FrameType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Connect => 0x01,
            Self::Connected => 0x02,
            Self::Data => 0x03,
            Self::Close => 0x04,
            Self::Error => 0x05,
            Self::Ping => 0x06,
            Self::Pong => 0x07,
        }
    }

    fn from_byte(b: u8) -> Result<Self, TunnelError> {
        match b {
            0x01 => Ok(Self::Connect),
            0x02 => Ok(Self::Connected),
            0x03 => Ok(Self::Data),
            0x04 => Ok(Self::Close),
            0x05 => Ok(Self::Error),
            0x06 => Ok(Self::Ping),
            0x07 => Ok(Self::Pong),
            other => Err(TunnelError::UnknownFrameType(other)),
        }
    }
}

/// Transport protocol for a CONNECT target (header byte 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelProto {
    Tcp,
    Udp,
}

impl TunnelProto {
    fn to_byte(self) -> u8 {
        match self {
            Self::Tcp => 0x00,
            Self::Udp => 0x01,
        }
    }

    fn from_byte(b: u8) -> Result<Self, TunnelError> {
        match b {
            0x00 => Ok(Self::Tcp),
            0x01 => Ok(Self::Udp),
            other => Err(TunnelError::UnknownProto(other)),
        }
    }
}

/// A decoded tunnel header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelHeader {
    pub frame_type: FrameType,
    pub proto: TunnelProto,
    pub client_id: u32,
    pub port: u16,
}

/// Errors decoding a tunnel header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("tunnel header too short: got {0} bytes, need {HEADER_LEN}")]
    TooShort(usize),
    #[error("unknown tunnel frame type byte 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("unknown tunnel proto byte 0x{0:02x}")]
    UnknownProto(u8),
}

impl TunnelHeader {
    /// Encode this header as 8 big-endian bytes.
    #[must_use]
    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.frame_type.to_byte();
        buf[1] = self.proto.to_byte();
        buf[2..6].copy_from_slice(&self.client_id.to_be_bytes());
        buf[6..8].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    /// Decode a header from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::TooShort`] if `bytes` has fewer than
    /// [`HEADER_LEN`] bytes, or an unknown-byte variant if the type or proto
    /// fields hold a value outside §4.8's table.
    pub fn decode(bytes: &[u8]) -> Result<Self, TunnelError> {
        if bytes.len() < HEADER_LEN {
            return Err(TunnelError::TooShort(bytes.len()));
        }
        let frame_type = FrameType::from_byte(bytes[0])?;
        let proto = TunnelProto::from_byte(bytes[1])?;
        let client_id = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let port = u16::from_be_bytes([bytes[6], bytes[7]]);
        Ok(Self {
            frame_type,
            proto,
            client_id,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TunnelHeader {
        TunnelHeader {
            frame_type: FrameType::Connect,
            proto: TunnelProto::Tcp,
            client_id: 42,
            port: 22,
        }
    }

    #[test]
    fn encode_decode_roundtrip_is_identity() {
        let header = sample();
        let encoded = header.encode();
        let decoded = TunnelHeader::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn encode_decode_roundtrip_with_trailing_payload() {
        let header = sample();
        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(b"payload bytes");
        let decoded = TunnelHeader::decode(&buf).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn decode_rejects_short_input() {
        for len in 0..HEADER_LEN {
            let buf = vec![0u8; len];
            let err = TunnelHeader::decode(&buf).unwrap_err();
            assert_eq!(err, TunnelError::TooShort(len));
        }
    }

    #[test]
    fn decode_rejects_unknown_frame_type() {
        let mut buf = sample().encode();
        buf[0] = 0xff;
        assert_eq!(
            TunnelHeader::decode(&buf).unwrap_err(),
            TunnelError::UnknownFrameType(0xff)
        );
    }

    #[test]
    fn decode_rejects_unknown_proto() {
        let mut buf = sample().encode();
        buf[1] = 0xff;
        assert_eq!(
            TunnelHeader::decode(&buf).unwrap_err(),
            TunnelError::UnknownProto(0xff)
        );
    }

    #[test]
    fn ping_is_runner_to_container_pong_is_reverse() {
        // Invariant (d): PING and PONG are distinct frame types; callers
        // enforce direction, the codec only needs to distinguish them.
        assert_ne!(FrameType::Ping.to_byte(), FrameType::Pong.to_byte());
    }
}

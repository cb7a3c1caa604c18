//! Packet framing for managed transports.
//!
//! Wire layout, all multi-byte fields big-endian:
//!
//! ```text
//! u16 length | u8 type | u32 route-id | payload[length - 5]
//! ```
//!
//! The length field counts the type byte, the route id and the payload.
//! Frames with `length < 5` or `length > MAX_FRAME_SIZE` are rejected and
//! close the transport they arrived on.

use crate::error::PacketError;
use crate::table::RouteId;
use std::fmt;

/// Maximum value of the frame length field.
pub const MAX_FRAME_SIZE: usize = 16384;

/// Fixed frame header size (length field included).
pub const PACKET_HEADER_SIZE: usize = 7;

/// Bytes of the length field consumed by the type byte and route id.
const FRAME_OVERHEAD: usize = 5;

/// Largest payload that fits a single frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_OVERHEAD;

/// Packet types carried on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Opaque application payload
    Data = 0x00,
    /// Circuit teardown; payload is a one-byte close code
    Close = 0x01,
    /// Rule activity refresh; empty payload
    KeepAlive = 0x02,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Data),
            0x01 => Ok(Self::Close),
            0x02 => Ok(Self::KeepAlive),
            other => Err(PacketError::UnknownPacketType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "Data"),
            Self::Close => write!(f, "Close"),
            Self::KeepAlive => write!(f, "KeepAlive"),
        }
    }
}

/// Close codes carried in the first payload byte of a Close packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u8);

impl CloseCode {
    /// Graceful close requested by the application.
    pub const NORMAL: CloseCode = CloseCode(0);
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NORMAL => write!(f, "normal"),
            Self(code) => write!(f, "code({code})"),
        }
    }
}

/// A framed unit on a managed transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    ty: PacketType,
    route_id: RouteId,
    payload: Vec<u8>,
}

impl Packet {
    /// Build a Data packet.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::PayloadTooLarge` if `payload` exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn data(route_id: RouteId, payload: Vec<u8>) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            ty: PacketType::Data,
            route_id,
            payload,
        })
    }

    /// Build a Close packet carrying `code`.
    #[must_use]
    pub fn close(route_id: RouteId, code: CloseCode) -> Self {
        Self {
            ty: PacketType::Close,
            route_id,
            payload: vec![code.0],
        }
    }

    /// Build an empty KeepAlive packet.
    #[must_use]
    pub fn keep_alive(route_id: RouteId) -> Self {
        Self {
            ty: PacketType::KeepAlive,
            route_id,
            payload: Vec::new(),
        }
    }

    /// Packet type.
    #[must_use]
    pub fn ty(&self) -> PacketType {
        self.ty
    }

    /// Route id the packet is addressed to.
    #[must_use]
    pub fn route_id(&self) -> RouteId {
        self.route_id
    }

    /// Payload view.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the packet, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Close code, if this is a Close packet with a payload.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        if self.ty == PacketType::Close {
            self.payload.first().map(|&b| CloseCode(b))
        } else {
            None
        }
    }

    /// Encode into a full wire frame (header included).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let len = (FRAME_OVERHEAD + self.payload.len()) as u16;
        let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.push(self.ty as u8);
        out.extend_from_slice(&self.route_id.0.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Validate a frame length read off the wire.
    ///
    /// # Errors
    ///
    /// `FrameTruncated` below the 5-byte minimum, `FrameTooLarge` above
    /// [`MAX_FRAME_SIZE`].
    pub fn check_frame_len(len: usize) -> Result<(), PacketError> {
        if len < FRAME_OVERHEAD {
            return Err(PacketError::FrameTruncated { len });
        }
        if len > MAX_FRAME_SIZE {
            return Err(PacketError::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(())
    }

    /// Decode the body of a frame (everything after the length field).
    ///
    /// # Errors
    ///
    /// `FrameTruncated` if the body is shorter than the type byte plus
    /// route id; `UnknownPacketType` on an unrecognized type byte.
    pub fn decode(body: &[u8]) -> Result<Self, PacketError> {
        if body.len() < FRAME_OVERHEAD {
            return Err(PacketError::FrameTruncated { len: body.len() });
        }
        let ty = PacketType::try_from(body[0])?;
        let route_id = RouteId(u32::from_be_bytes([body[1], body[2], body[3], body[4]]));
        Ok(Self {
            ty,
            route_id,
            payload: body[FRAME_OVERHEAD..].to_vec(),
        })
    }
}

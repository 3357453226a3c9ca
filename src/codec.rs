//! Link frame codec for tokio.
//!
//! This module provides a codec implementation for encoding and decoding
//! link frames using the tokio-util codec framework.
//!
//! ```text
//! +------+------+-----------+----------+-------------+-------------+---------+
//! | 0x05 | 0x64 | len (u16) | function | dest (u16)  | src (u16)   | payload |
//! +------+------+-----------+----------+-------------+-------------+---------+
//! ```
//!
//! `len` counts the function byte, both addresses and the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::Dnp3Error;
use crate::types::LinkFunction;

/// Frame start bytes.
pub const START_BYTES: [u8; 2] = [0x05, 0x64];

/// Size of the function byte plus both addresses.
pub const MIN_FRAME_LENGTH: usize = 5;

/// Largest application fragment carried in one frame.
pub const MAX_PAYLOAD_LENGTH: usize = 2048;

/// Largest value of the length field.
pub const MAX_FRAME_LENGTH: usize = MIN_FRAME_LENGTH + MAX_PAYLOAD_LENGTH;

/// Lowest broadcast address.
pub const BROADCAST_MIN: u16 = 0xFFFD;

/// A link frame carrying an optional application fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFrame {
    /// Link function
    pub function: LinkFunction,
    /// Destination address
    pub destination: u16,
    /// Source address
    pub source: u16,
    /// Application fragment (empty for link status frames)
    pub payload: Bytes,
}

impl LinkFrame {
    /// Create a user data frame.
    pub fn user_data(destination: u16, source: u16, payload: Bytes) -> Self {
        Self {
            function: LinkFunction::UserData,
            destination,
            source,
            payload,
        }
    }

    /// Create a link status request.
    pub fn request_link_status(destination: u16, source: u16) -> Self {
        Self {
            function: LinkFunction::RequestLinkStatus,
            destination,
            source,
            payload: Bytes::new(),
        }
    }

    /// Create a link status answer.
    pub fn link_status(destination: u16, source: u16) -> Self {
        Self {
            function: LinkFunction::LinkStatus,
            destination,
            source,
            payload: Bytes::new(),
        }
    }

    /// Check if the destination is a broadcast address.
    pub fn is_broadcast(&self) -> bool {
        is_broadcast(self.destination)
    }
}

impl std::fmt::Display for LinkFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} dest: {} src: {} len: {}",
            self.function,
            self.destination,
            self.source,
            self.payload.len()
        )
    }
}

/// Check if an address is one of the broadcast addresses.
pub fn is_broadcast(address: u16) -> bool {
    address >= BROADCAST_MIN
}

/// Link frame codec.
///
/// # Example
///
/// ```rust,ignore
/// use tokio_util::codec::Framed;
/// use voltage_dnp3::codec::{LinkCodec, LinkFrame};
///
/// let stream = TcpStream::connect("192.168.1.100:20000").await?;
/// let mut framed = Framed::new(stream, LinkCodec::new());
///
/// framed.send(LinkFrame::request_link_status(1024, 1)).await?;
/// while let Some(frame) = framed.next().await {
///     println!("Received: {}", frame?);
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct LinkCodec {
    state: DecodeState,
}

#[derive(Debug, Clone, Default)]
#[allow(clippy::enum_variant_names)]
enum DecodeState {
    #[default]
    WaitingForStart,
    WaitingForLength,
    WaitingForData {
        length: usize,
    },
}

impl LinkCodec {
    /// Create a new link codec.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LinkCodec {
    type Item = LinkFrame;
    type Error = Dnp3Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            match &self.state {
                DecodeState::WaitingForStart => {
                    // Skip bytes until the start sequence is at the front
                    while src.len() >= 2 && src[..2] != START_BYTES {
                        src.advance(1);
                    }

                    if src.len() < 2 {
                        // Keep a possible first start byte
                        if src.len() == 1 && src[0] != START_BYTES[0] {
                            src.advance(1);
                        }
                        return Ok(None);
                    }

                    self.state = DecodeState::WaitingForLength;
                }

                DecodeState::WaitingForLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }

                    let length = u16::from_le_bytes([src[2], src[3]]) as usize;

                    if !(MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH).contains(&length) {
                        // Invalid length, skip start byte and restart
                        src.advance(1);
                        self.state = DecodeState::WaitingForStart;
                        continue;
                    }

                    self.state = DecodeState::WaitingForData { length };
                }

                DecodeState::WaitingForData { length } => {
                    let total_length = 4 + length;

                    if src.len() < total_length {
                        src.reserve(total_length - src.len());
                        return Ok(None);
                    }

                    let mut frame = src.split_to(total_length);
                    self.state = DecodeState::WaitingForStart;

                    frame.advance(4);
                    let raw_function = frame.get_u8();
                    let destination = frame.get_u16_le();
                    let source = frame.get_u16_le();

                    let Some(function) = LinkFunction::from_u8(raw_function) else {
                        warn!("Dropping frame with unknown link function 0x{raw_function:02X}");
                        continue;
                    };

                    return Ok(Some(LinkFrame {
                        function,
                        destination,
                        source,
                        payload: frame.freeze(),
                    }));
                }
            }
        }
    }
}

impl Encoder<LinkFrame> for LinkCodec {
    type Error = Dnp3Error;

    fn encode(
        &mut self,
        item: LinkFrame,
        dst: &mut BytesMut,
    ) -> std::result::Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(Dnp3Error::Codec(format!(
                "payload too large: {} bytes",
                item.payload.len()
            )));
        }

        let length = MIN_FRAME_LENGTH + item.payload.len();
        dst.reserve(4 + length);
        dst.put_slice(&START_BYTES);
        dst.put_u16_le(length as u16);
        dst.put_u8(item.function as u8);
        dst.put_u16_le(item.destination);
        dst.put_u16_le(item.source);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

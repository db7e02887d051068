// Copyright 2022 Protocol Labs.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! The frame exchanged in plaintext before the TLS handshake.
//!
//! Each peer sends a single protobuf encoded `Packet { magic, fin }` without
//! any length prefix. The receiver does not know how long the frame is, so it
//! feeds the bytes it has so far to [`MagicFrame::decode`] until a complete
//! frame comes out.

use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Writer};
use rand::Rng;

use crate::proto::Packet;

/// Exclusive upper bound of the negotiation value.
pub const MAGIC_MAX: i64 = 10_000_000_000;

/// Number of buffered bytes after which a receiver gives up on finding a frame.
///
/// A frame carrying a value below [`MAGIC_MAX`] takes 8 bytes, an arbitrary
/// `int64` at most 13.
pub const MAX_FRAME_LEN: usize = 16;

/// A decoded negotiation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicFrame {
    pub value: i64,
    pub fin: bool,
}

/// The buffer does not (yet) hold a complete frame.
///
/// A truncated frame and bytes that will never decode are not told apart; the
/// caller keeps reading until it hits [`MAX_FRAME_LEN`].
#[derive(Debug, thiserror::Error)]
pub enum IncompleteFrame {
    #[error("Failed to parse negotiation frame")]
    Malformed(#[from] quick_protobuf::Error),
    #[error("Negotiation frame is missing a field or is not final")]
    Partial,
}

impl MagicFrame {
    /// Draws a fresh final frame with a value uniformly distributed in `[0, MAGIC_MAX)`.
    pub fn random() -> Self {
        Self::new(rand::thread_rng().gen_range(0..MAGIC_MAX))
    }

    pub fn new(value: i64) -> Self {
        Self { value, fin: true }
    }

    pub fn encode(&self) -> Vec<u8> {
        let packet = Packet {
            magic: Some(self.value),
            fin: Some(self.fin),
        };

        let mut buf = Vec::with_capacity(packet.get_size());
        let mut writer = Writer::new(&mut buf);
        packet
            .write_message(&mut writer)
            .expect("Writing to a Vec never fails; qed");

        buf
    }

    /// Attempts to decode a complete frame from `buf`.
    ///
    /// Succeeds only once both fields were read and `fin` is set.
    pub fn decode(buf: &[u8]) -> Result<Self, IncompleteFrame> {
        let mut reader = BytesReader::from_bytes(buf);
        let packet = Packet::from_reader(&mut reader, buf)?;

        match packet {
            Packet {
                magic: Some(value),
                fin: Some(true),
            } => Ok(Self { value, fin: true }),
            _ => Err(IncompleteFrame::Partial),
        }
    }
}

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

//! Deciding which side of a connection runs the TLS server.
//!
//! Both peers send a random [`MagicFrame`] and read the other one back. The
//! peer that drew the larger value becomes the TLS server, the other one the
//! client. Both compute complementary roles from the same pair of values, so no
//! further round trip is needed.

use std::{cmp::Ordering, io};

use futures::prelude::*;

use crate::magic::{MagicFrame, MAGIC_MAX, MAX_FRAME_LEN};

/// The TLS role a peer takes after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Compares our value against the remote's.
    ///
    /// The side holding the larger value is the server. Equal values have no
    /// valid outcome.
    pub fn decide(local: i64, remote: i64) -> Result<Self, NegotiationError> {
        match remote.cmp(&local) {
            Ordering::Less => Ok(Role::Server),
            Ordering::Greater => Ok(Role::Client),
            Ordering::Equal => Err(NegotiationError::MagicCollision(local)),
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Role::Server)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("I/O error during role negotiation")]
    Io(#[from] io::Error),
    #[error("No valid negotiation frame after {0} bytes")]
    FrameTooLong(usize),
    #[error("Both peers drew the same negotiation value {0}")]
    MagicCollision(i64),
    #[error("Negotiation value {0} is out of range")]
    MagicOutOfRange(i64),
}

/// Runs the role negotiation on `socket`.
///
/// `local` is written and flushed before anything is read. The remote frame is
/// then read one byte at a time, so that no byte belonging to the following
/// TLS handshake is consumed; once this returns, `socket` is positioned right
/// after the remote's frame.
pub async fn negotiate<S>(socket: &mut S, local: MagicFrame) -> Result<Role, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::trace!(magic=%local.value, "sending negotiation frame");
    socket.write_all(&local.encode()).await?;
    socket.flush().await?;

    let remote = read_frame(socket).await?;
    tracing::debug!(ours=%local.value, theirs=%remote.value, "received remote negotiation frame");

    if !(0..MAGIC_MAX).contains(&remote.value) {
        return Err(NegotiationError::MagicOutOfRange(remote.value));
    }

    let role = Role::decide(local.value, remote.value)?;
    tracing::debug!(?role, "negotiated TLS role");

    Ok(role)
}

async fn read_frame<S>(socket: &mut S) -> Result<MagicFrame, NegotiationError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(MAX_FRAME_LEN);
    let mut byte = [0u8; 1];

    loop {
        socket.read_exact(&mut byte).await?;
        buffer.push(byte[0]);
        tracing::trace!(bytes=%buffer.len(), "read negotiation byte");

        if let Ok(frame) = MagicFrame::decode(&buffer) {
            return Ok(frame);
        }

        if buffer.len() >= MAX_FRAME_LEN {
            return Err(NegotiationError::FrameTooLong(buffer.len()));
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{executor::block_on, future};
    use futures_ringbuf::Endpoint;
    use quickcheck::{QuickCheck, TestResult};

    use super::*;

    #[test]
    fn larger_value_is_the_server() {
        assert_eq!(Role::decide(9001, 42).unwrap(), Role::Server);
        assert_eq!(Role::decide(42, 9001).unwrap(), Role::Client);
        assert!(matches!(
            Role::decide(7, 7),
            Err(NegotiationError::MagicCollision(7))
        ));
    }

    #[test]
    fn roles_are_complementary() {
        fn prop(a: u32, b: u32) -> TestResult {
            if a == b {
                return TestResult::discard();
            }

            let (a, b) = (i64::from(a), i64::from(b));
            let (role_a, role_b) = block_on(async {
                let (mut socket_a, mut socket_b) = Endpoint::pair(64, 64);
                future::try_join(
                    negotiate(&mut socket_a, MagicFrame::new(a)),
                    negotiate(&mut socket_b, MagicFrame::new(b)),
                )
                .await
                .unwrap()
            });

            TestResult::from_bool(
                role_a != role_b && role_a.is_server() == (a > b) && role_b.is_server() == (b > a),
            )
        }

        QuickCheck::new()
            .tests(50)
            .quickcheck(prop as fn(u32, u32) -> TestResult)
    }

    #[test]
    fn collision_fails_on_both_sides() {
        let (a, b) = block_on(async {
            let (mut socket_a, mut socket_b) = Endpoint::pair(64, 64);
            future::join(
                negotiate(&mut socket_a, MagicFrame::new(5)),
                negotiate(&mut socket_b, MagicFrame::new(5)),
            )
            .await
        });

        assert!(matches!(a, Err(NegotiationError::MagicCollision(5))));
        assert!(matches!(b, Err(NegotiationError::MagicCollision(5))));
    }

    #[test]
    fn noise_fails_with_frame_too_long() {
        let result = block_on(async {
            let (mut socket, mut remote) = Endpoint::pair(64, 64);
            remote.write_all(&[0xff; 20]).await.unwrap();

            negotiate(&mut socket, MagicFrame::new(1)).await
        });

        assert!(matches!(
            result,
            Err(NegotiationError::FrameTooLong(MAX_FRAME_LEN))
        ));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for value in [-1, MAGIC_MAX, i64::MAX] {
            let result = block_on(async {
                let (mut socket, mut remote) = Endpoint::pair(64, 64);
                remote
                    .write_all(&MagicFrame::new(value).encode())
                    .await
                    .unwrap();

                negotiate(&mut socket, MagicFrame::new(1)).await
            });

            assert!(
                matches!(result, Err(NegotiationError::MagicOutOfRange(v)) if v == value),
                "{value} was accepted"
            );
        }
    }

    #[test]
    fn closed_stream_fails_the_negotiation() {
        let result = block_on(async {
            let (mut socket, mut remote) = Endpoint::pair(64, 64);
            remote.write_all(&[0x08]).await.unwrap();
            remote.close().await.unwrap();

            negotiate(&mut socket, MagicFrame::new(1)).await
        });

        assert!(matches!(result, Err(NegotiationError::Io(_))));
    }

    #[test]
    fn bytes_after_the_frame_are_left_in_the_stream() {
        let (role, rest) = block_on(async {
            let (mut socket, mut remote) = Endpoint::pair(64, 64);
            let mut sent = MagicFrame::new(10).encode();
            sent.extend_from_slice(b"tls bytes");
            remote.write_all(&sent).await.unwrap();

            let role = negotiate(&mut socket, MagicFrame::new(20)).await.unwrap();
            let mut rest = [0u8; 9];
            socket.read_exact(&mut rest).await.unwrap();

            (role, rest)
        });

        assert_eq!(role, Role::Server);
        assert_eq!(&rest, b"tls bytes");
    }
}

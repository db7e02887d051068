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

use std::{
    fmt, io,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    channel::oneshot,
    executor::{ThreadPool, ThreadPoolBuilder},
    future::BoxFuture,
    prelude::*,
    ready,
};
use futures_rustls::TlsStream;
use libp2p_identity::PeerId;
use once_cell::sync::OnceCell;

use crate::upgrade::{Config, UpgradeError};

type Upgraded<C> = Result<(PeerId, TlsStream<C>), UpgradeError>;

/// Implemented on objects that can run a `Future` in the background.
///
/// The handshake of a [`Connection`] runs on its own task so that it makes
/// progress whether or not the connection is used.
pub trait Executor {
    /// Run the given future in the background until it ends.
    fn exec(&self, future: BoxFuture<'static, ()>);
}

impl<F: Fn(BoxFuture<'static, ()>)> Executor for F {
    fn exec(&self, f: BoxFuture<'static, ()>) {
        self(f)
    }
}

impl Executor for ThreadPool {
    fn exec(&self, future: BoxFuture<'static, ()>) {
        self.spawn_ok(future)
    }
}

/// Pool used by [`crate::encrypt`] when no executor is given.
pub(crate) fn shared_executor() -> Result<&'static ThreadPool, UpgradeError> {
    static POOL: OnceCell<ThreadPool> = OnceCell::new();

    POOL.get_or_try_init(|| {
        ThreadPoolBuilder::new()
            .name_prefix("tls-magic-handshake-")
            .create()
    })
    .map_err(UpgradeError::Executor)
}

/// A connection whose handshake runs in the background.
///
/// The handshake (role negotiation, TLS, identity check) starts as soon as the
/// connection is created and is bounded by the configured timeout. Reads and
/// writes issued before it completes wait for it; afterwards all I/O goes
/// through the encrypted stream. If the handshake fails, every operation fails
/// with the same error.
pub struct Connection<C> {
    state: State<C>,
}

enum State<C> {
    Handshaking(oneshot::Receiver<Upgraded<C>>),
    Established {
        remote_peer_id: PeerId,
        stream: TlsStream<C>,
    },
    Failed(Arc<UpgradeError>),
}

impl<C> Connection<C>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Starts securing `socket` on `executor`, logging a failed handshake.
    pub fn new<E>(config: Config, socket: C, executor: &E) -> Self
    where
        E: Executor + ?Sized,
    {
        Self::with_callback(config, socket, executor, |result| {
            if let Err(error) = result {
                tracing::error!(?error, "TLS upgrade failed");
            }
        })
    }

    /// Starts securing `socket` on `executor`. `callback` is invoked exactly
    /// once with the outcome, before the outcome is visible on the connection.
    pub fn with_callback<E, F>(config: Config, socket: C, executor: &E, callback: F) -> Self
    where
        E: Executor + ?Sized,
        F: FnOnce(Result<(), &UpgradeError>) + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let handshake = async move {
            // A panic anywhere in the handshake fails this connection only.
            let result = AssertUnwindSafe(config.upgrade(socket))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(UpgradeError::Panicked));

            match &result {
                Ok((remote, _)) => {
                    tracing::debug!(%remote, "Secure channel established");
                    callback(Ok(()));
                }
                Err(error) => callback(Err(error)),
            }

            // The receiver is gone if the connection was dropped.
            let _ = sender.send(result);
        };
        executor.exec(handshake.boxed());

        Self {
            state: State::Handshaking(receiver),
        }
    }

    /// Waits for the handshake and returns the authenticated remote.
    pub async fn established(&mut self) -> io::Result<PeerId> {
        future::poll_fn(|cx| self.poll_handshake(cx)).await?;

        self.remote_peer_id()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl<C> Connection<C> {
    /// The authenticated remote, once the handshake succeeded and was observed.
    pub fn remote_peer_id(&self) -> Option<PeerId> {
        match &self.state {
            State::Established { remote_peer_id, .. } => Some(*remote_peer_id),
            _ => None,
        }
    }

    /// Why the handshake failed, once the failure was observed.
    pub fn error(&self) -> Option<&UpgradeError> {
        match &self.state {
            State::Failed(error) => Some(error),
            _ => None,
        }
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.state {
            State::Handshaking(receiver) => {
                let result = ready!(receiver.poll_unpin(cx))
                    .unwrap_or_else(|oneshot::Canceled| Err(UpgradeError::Aborted));

                match result {
                    Ok((remote_peer_id, stream)) => {
                        self.state = State::Established {
                            remote_peer_id,
                            stream,
                        };

                        Poll::Ready(Ok(()))
                    }
                    Err(error) => {
                        let error = Arc::new(error);
                        self.state = State::Failed(error.clone());

                        Poll::Ready(Err(io::Error::other(error)))
                    }
                }
            }
            State::Established { .. } => Poll::Ready(Ok(())),
            State::Failed(error) => Poll::Ready(Err(io::Error::other(error.clone()))),
        }
    }

    fn poll_stream(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<&mut TlsStream<C>>> {
        ready!(self.poll_handshake(cx))?;

        match &mut self.state {
            State::Established { stream, .. } => Poll::Ready(Ok(stream)),
            _ => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}

impl<C> AsyncRead for Connection<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_read(cx, buf)
    }
}

impl<C> AsyncWrite for Connection<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        Pin::new(stream).poll_close(cx)
    }
}

impl<C> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Handshaking(_) => "handshaking",
            State::Established { .. } => "established",
            State::Failed(_) => "failed",
        };

        f.debug_struct("Connection")
            .field("state", &state)
            .field("remote_peer_id", &self.remote_peer_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use futures::{executor::block_on, prelude::*};
    use futures_ringbuf::Endpoint;
    use futures_timer::Delay;
    use libp2p_identity::Keypair;

    use super::*;
    use crate::negotiation::NegotiationError;

    const ALICE: &[u8] = include_bytes!("./test_assets/rsa_alice.pk8");
    const BOB: &[u8] = include_bytes!("./test_assets/rsa_bob.pk8");

    fn config(pkcs8: &[u8]) -> Config {
        let peer_id = Keypair::rsa_from_pkcs8(&mut pkcs8.to_vec())
            .unwrap()
            .public()
            .to_peer_id();

        Config::new(peer_id, pkcs8).unwrap()
    }

    fn pool() -> ThreadPool {
        ThreadPool::new().unwrap()
    }

    #[test]
    fn magic_is_sent_without_touching_the_connection() {
        let (socket, mut remote) = Endpoint::pair(1024, 1024);
        let connection = Connection::new(config(ALICE).with_magic(42), socket, &pool());

        let mut frame = [0u8; 4];
        let read = block_on(future::select(
            remote.read_exact(&mut frame),
            Delay::new(Duration::from_secs(5)),
        ));

        assert!(matches!(read, future::Either::Left((Ok(()), _))));
        assert_eq!(frame, [0x08, 42, 0x10, 0x01]);
        assert!(connection.remote_peer_id().is_none());
    }

    #[test]
    fn callbacks_fire_without_touching_the_connections() {
        let executor = pool();
        let (socket_a, socket_b) = Endpoint::pair(16 * 1024, 16 * 1024);
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();

        let _alice = Connection::with_callback(config(ALICE), socket_a, &executor, move |r| {
            let _ = tx_a.send(r.is_ok());
        });
        let _bob = Connection::with_callback(config(BOB), socket_b, &executor, move |r| {
            let _ = tx_b.send(r.is_ok());
        });

        let outcome = block_on(future::select(
            future::try_join(rx_a, rx_b).boxed(),
            Delay::new(Duration::from_secs(30)),
        ));

        match outcome {
            future::Either::Left((Ok((a, b)), _)) => assert!(a && b),
            _ => panic!("handshake did not complete in the background"),
        }
    }

    #[test]
    fn writes_wait_for_the_handshake() {
        let executor = pool();
        let (socket_a, socket_b) = Endpoint::pair(16 * 1024, 16 * 1024);
        let mut alice = Connection::new(config(ALICE).with_magic(1), socket_a, &executor);
        let mut bob = Connection::new(config(BOB).with_magic(2), socket_b, &executor);

        let received = block_on(async {
            let write = async {
                alice.write_all(b"ping").await.unwrap();
                alice.flush().await.unwrap();
            };
            let read = async {
                let mut buf = [0u8; 4];
                bob.read_exact(&mut buf).await.unwrap();
                buf
            };

            future::join(write, read).await.1
        });

        assert_eq!(&received, b"ping");
        assert_eq!(alice.remote_peer_id(), Some(config(BOB).local_peer_id()));
        assert_eq!(bob.remote_peer_id(), Some(config(ALICE).local_peer_id()));
    }

    #[test]
    fn failure_is_reported_once_and_sticks() {
        let executor = pool();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let (socket_a, socket_b) = Endpoint::pair(1024, 1024);

        let recorder = outcomes.clone();
        let mut alice = Connection::with_callback(
            config(ALICE).with_magic(3),
            socket_a,
            &executor,
            move |result| recorder.lock().unwrap().push(result.is_ok()),
        );
        let mut bob = Connection::new(config(BOB).with_magic(3), socket_b, &executor);

        let (a, b) = block_on(future::join(alice.established(), bob.established()));
        assert!(a.is_err());
        assert!(b.is_err());
        assert!(matches!(
            alice.error(),
            Some(UpgradeError::Negotiation(NegotiationError::MagicCollision(3)))
        ));

        // Later I/O keeps failing without running the callback again.
        let write = block_on(alice.write_all(b"too late"));
        assert!(write.is_err());
        assert_eq!(*outcomes.lock().unwrap(), vec![false]);
    }

    #[test]
    fn panicking_handshake_fails_only_its_connection() {
        let executor = pool();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let (socket, _remote) = Endpoint::pair(1024, 1024);

        let recorder = outcomes.clone();
        let mut connection = Connection::with_callback(
            config(ALICE).with_panic(),
            socket,
            &executor,
            move |result| recorder.lock().unwrap().push(result.err().map(|e| e.to_string())),
        );

        assert!(block_on(connection.established()).is_err());
        assert!(matches!(connection.error(), Some(UpgradeError::Panicked)));
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![Some(UpgradeError::Panicked.to_string())]
        );

        // The executor is still usable.
        let (socket_a, socket_b) = Endpoint::pair(16 * 1024, 16 * 1024);
        let mut alice = Connection::new(config(ALICE), socket_a, &executor);
        let mut bob = Connection::new(config(BOB), socket_b, &executor);
        let (a, b) = block_on(future::join(alice.established(), bob.established()));
        assert_eq!(a.unwrap(), config(BOB).local_peer_id());
        assert_eq!(b.unwrap(), config(ALICE).local_peer_id());
    }

    #[test]
    fn dropped_handshake_task_aborts_the_connection() {
        let (socket, _remote) = Endpoint::pair(1024, 1024);
        let discard = |future: BoxFuture<'static, ()>| drop(future);
        let mut connection = Connection::new(config(ALICE), socket, &discard);

        assert!(block_on(connection.established()).is_err());
        assert!(matches!(connection.error(), Some(UpgradeError::Aborted)));
    }
}

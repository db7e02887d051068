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
    io,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use futures::{
    future::{self, BoxFuture, Either},
    AsyncRead, AsyncWrite, FutureExt,
};
use futures_rustls::TlsStream;
use futures_timer::Delay;
use libp2p_core::{
    upgrade::{InboundConnectionUpgrade, OutboundConnectionUpgrade},
    UpgradeInfo,
};
use libp2p_identity::{Keypair, PeerId};
use rustls::{pki_types::ServerName, CommonState};
use zeroize::Zeroizing;

use crate::{
    certificate::{self, IssuedCertificate},
    magic::MagicFrame,
    negotiation::{self, NegotiationError, Role},
    resolver::{self, ResolveError},
};

/// Protocol name advertised during multistream-select.
pub const PROTOCOL_NAME: &str = "/tls/1.0.0";

/// How long negotiation and TLS handshake together may take by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(thiserror::Error, Debug)]
pub enum UpgradeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Failed to decode the local private key")]
    KeyFormat(#[source] libp2p_identity::DecodingError),
    #[error("Failed to generate certificate")]
    CertificateGeneration(#[from] certificate::GenError),
    #[error("Failed to build TLS configuration")]
    TlsConfig(#[from] rustls::Error),
    #[error("Failed to negotiate the TLS role")]
    Negotiation(#[from] NegotiationError),
    #[error("Handshake did not complete within {0:?}")]
    Timeout(Duration),
    #[error("Failed to upgrade server connection")]
    ServerUpgrade(#[source] io::Error),
    #[error("Failed to upgrade client connection")]
    ClientUpgrade(#[source] io::Error),
    #[error("Remote did not present exactly one certificate")]
    MissingCertificate,
    #[error("Failed to verify the remote identity")]
    Identity(#[from] ResolveError),
    #[error("Handshake panicked")]
    Panicked,
    #[error("Handshake task was dropped before it completed")]
    Aborted,
    #[error("Failed to start the handshake executor")]
    Executor(#[source] io::Error),
}

/// Everything needed to secure connections for one local identity.
///
/// A new certificate is issued for every connection.
#[derive(Clone)]
pub struct Config {
    local_peer_id: PeerId,
    /// RSA host key, PKCS#8 DER.
    private_key: Arc<Zeroizing<Vec<u8>>>,
    timeout: Duration,
    #[cfg(test)]
    magic: Option<MagicFrame>,
    #[cfg(test)]
    common_name: Option<String>,
    #[cfg(test)]
    panic: bool,
}

impl Config {
    /// Creates a configuration for `local_peer_id` and its RSA private key in PKCS#8 DER form.
    ///
    /// Fails if the key is missing or malformed, or if it does not belong to `local_peer_id`.
    pub fn new(local_peer_id: PeerId, private_key: &[u8]) -> Result<Self, UpgradeError> {
        if private_key.is_empty() {
            return Err(UpgradeError::InvalidArgument("no local private key provided"));
        }

        let keypair = Keypair::rsa_from_pkcs8(&mut private_key.to_vec())
            .map_err(UpgradeError::KeyFormat)?;
        if keypair.public().to_peer_id() != local_peer_id {
            return Err(UpgradeError::InvalidArgument(
                "private key does not belong to the local peer id",
            ));
        }

        Ok(Self {
            local_peer_id,
            private_key: Arc::new(Zeroizing::new(private_key.to_vec())),
            timeout: DEFAULT_TIMEOUT,
            #[cfg(test)]
            magic: None,
            #[cfg(test)]
            common_name: None,
            #[cfg(test)]
            panic: false,
        })
    }

    /// Sets the deadline for negotiation and TLS handshake combined.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    #[cfg(test)]
    pub(crate) fn with_magic(mut self, value: i64) -> Self {
        self.magic = Some(MagicFrame::new(value));
        self
    }

    #[cfg(test)]
    pub(crate) fn with_common_name(mut self, common_name: impl Into<String>) -> Self {
        self.common_name = Some(common_name.into());
        self
    }

    #[cfg(test)]
    pub(crate) fn with_panic(mut self) -> Self {
        self.panic = true;
        self
    }

    /// Negotiates roles on `socket`, runs the TLS handshake and verifies the
    /// remote identity.
    ///
    /// Fails with [`UpgradeError::Timeout`] if this takes longer than the
    /// configured deadline.
    pub async fn upgrade<C>(self, socket: C) -> Result<(PeerId, TlsStream<C>), UpgradeError>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let timeout = self.timeout;

        match future::select(self.handshake(socket).boxed(), Delay::new(timeout)).await {
            Either::Left((result, _)) => result,
            Either::Right(((), _)) => {
                tracing::debug!(?timeout, "TLS upgrade timed out");
                Err(UpgradeError::Timeout(timeout))
            }
        }
    }

    async fn handshake<C>(self, mut socket: C) -> Result<(PeerId, TlsStream<C>), UpgradeError>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tracing::debug!(local=%self.local_peer_id, "Starting TLS upgrade.");

        #[cfg(test)]
        if self.panic {
            panic!("handshake of {} panicked", self.local_peer_id);
        }

        let certificate = self.issue_certificate()?;
        let role = negotiation::negotiate(&mut socket, self.local_magic()).await?;

        let (peer_id, stream) = match role {
            Role::Server => {
                let config = crate::make_server_config(&certificate)?;
                let stream = futures_rustls::TlsAcceptor::from(Arc::new(config))
                    .accept(socket)
                    .await
                    .map_err(UpgradeError::ServerUpgrade)?;

                let peer_id = resolve_remote(stream.get_ref().1)?;

                (peer_id, stream.into())
            }
            Role::Client => {
                let config = crate::make_client_config(&certificate)?;
                // Peers are not addressed by name; setting `ServerName` to
                // unspecified disables the use of the SNI extension.
                let name = ServerName::IpAddress(IpAddr::V4(Ipv4Addr::UNSPECIFIED).into());
                let stream = futures_rustls::TlsConnector::from(Arc::new(config))
                    .connect(name, socket)
                    .await
                    .map_err(UpgradeError::ClientUpgrade)?;

                let peer_id = resolve_remote(stream.get_ref().1)?;

                (peer_id, stream.into())
            }
        };

        tracing::debug!(remote=%peer_id, ?role, "Finished TLS upgrade.");

        Ok((peer_id, stream))
    }

    fn local_magic(&self) -> MagicFrame {
        #[cfg(test)]
        if let Some(magic) = self.magic {
            return magic;
        }

        MagicFrame::random()
    }

    fn issue_certificate(&self) -> Result<IssuedCertificate, certificate::GenError> {
        tracing::trace!(local=%self.local_peer_id, "issuing self-signed certificate");

        #[cfg(test)]
        if let Some(common_name) = &self.common_name {
            return certificate::generate_with_common_name(
                common_name,
                &self.private_key,
                time::OffsetDateTime::now_utc(),
            );
        }

        certificate::generate(&self.local_peer_id, &self.private_key)
    }
}

impl UpgradeInfo for Config {
    type Info = &'static str;
    type InfoIter = std::iter::Once<Self::Info>;

    fn protocol_info(&self) -> Self::InfoIter {
        std::iter::once(PROTOCOL_NAME)
    }
}

// Roles are decided by the negotiation, so dialer and listener run the same upgrade.
impl<C> InboundConnectionUpgrade<C> for Config
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Output = (PeerId, TlsStream<C>);
    type Error = UpgradeError;
    type Future = BoxFuture<'static, Result<Self::Output, Self::Error>>;

    fn upgrade_inbound(self, socket: C, _: Self::Info) -> Self::Future {
        self.upgrade(socket).boxed()
    }
}

impl<C> OutboundConnectionUpgrade<C> for Config
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Output = (PeerId, TlsStream<C>);
    type Error = UpgradeError;
    type Future = BoxFuture<'static, Result<Self::Output, Self::Error>>;

    fn upgrade_outbound(self, socket: C, _: Self::Info) -> Self::Future {
        self.upgrade(socket).boxed()
    }
}

fn resolve_remote(state: &CommonState) -> Result<PeerId, UpgradeError> {
    let Some([certificate]) = state.peer_certificates() else {
        return Err(UpgradeError::MissingCertificate);
    };

    Ok(resolver::resolve(certificate)?)
}

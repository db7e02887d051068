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

//! TLS for connections where neither side is known up front to be the dialer.
//!
//! Upgrading a raw stream happens in two phases:
//!
//! 1. Both peers send a small random "magic" value and compare it with the
//!    one they receive. The larger value takes the TLS server role, see
//!    [`negotiation`].
//! 2. The peers run a TLS 1.3 handshake with mutual authentication, each
//!    presenting a fresh self-signed certificate issued with its RSA host key.
//!    The certificate's Common Name carries the peer's [`PeerId`], which is
//!    checked against the key that signed it, see [`resolver`].
//!
//! [`encrypt`] wraps a socket into a [`Connection`] and runs both phases on a
//! background task right away. [`Config`] can also be used directly, either through
//! [`Config::upgrade`] or as a libp2p connection upgrade.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod certificate;
mod connection;
pub mod magic;
pub mod negotiation;
pub mod resolver;
mod upgrade;
mod verifier;

mod proto {
    #![allow(unreachable_pub)]
    include!("generated/mod.rs");
    pub(crate) use self::packet::Packet;
}

use std::sync::Arc;

use futures::{AsyncRead, AsyncWrite};
use libp2p_identity::PeerId;

pub use crate::{
    certificate::IssuedCertificate,
    connection::{Connection, Executor},
    upgrade::{Config, UpgradeError, DEFAULT_TIMEOUT, PROTOCOL_NAME},
};

/// Create a TLS client configuration presenting `certificate`.
pub fn make_client_config(
    certificate: &IssuedCertificate,
) -> Result<rustls::ClientConfig, rustls::Error> {
    let provider = rustls::crypto::CryptoProvider {
        cipher_suites: verifier::CIPHERSUITES.to_vec(),
        ..rustls::crypto::ring::default_provider()
    };

    let crypto = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(verifier::PROTOCOL_VERSIONS)
        .expect("Cipher suites and kx groups are configured; qed")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier::SelfSignedCertificateVerifier))
        .with_client_auth_cert(
            vec![certificate.certificate_der()],
            certificate.private_key_der(),
        )?;

    Ok(crypto)
}

/// Create a TLS server configuration presenting `certificate` and requiring
/// one from the client.
pub fn make_server_config(
    certificate: &IssuedCertificate,
) -> Result<rustls::ServerConfig, rustls::Error> {
    let provider = rustls::crypto::CryptoProvider {
        cipher_suites: verifier::CIPHERSUITES.to_vec(),
        ..rustls::crypto::ring::default_provider()
    };

    let crypto = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(verifier::PROTOCOL_VERSIONS)
        .expect("Cipher suites and kx groups are configured; qed")
        .with_client_cert_verifier(Arc::new(verifier::SelfSignedCertificateVerifier))
        .with_single_cert(
            vec![certificate.certificate_der()],
            certificate.private_key_der(),
        )?;

    Ok(crypto)
}

/// Wraps `socket` into a [`Connection`] secured for `local_peer_id`.
///
/// `private_key` is the RSA host key of `local_peer_id` in PKCS#8 DER form.
/// Only the arguments are checked here; the handshake starts immediately on a
/// thread pool shared by all connections. A failed handshake is logged.
///
/// Use [`Connection::new`] to run the handshake on an [`Executor`] of your own.
pub fn encrypt<C>(
    local_peer_id: PeerId,
    private_key: &[u8],
    socket: C,
) -> Result<Connection<C>, UpgradeError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let config = Config::new(local_peer_id, private_key)?;

    Ok(Connection::new(config, socket, connection::shared_executor()?))
}

/// Like [`encrypt`], but reports the outcome of the handshake to `callback`
/// instead of logging it.
pub fn encrypt_with_callback<C, F>(
    local_peer_id: PeerId,
    private_key: &[u8],
    socket: C,
    callback: F,
) -> Result<Connection<C>, UpgradeError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: FnOnce(Result<(), &UpgradeError>) + Send + 'static,
{
    let config = Config::new(local_peer_id, private_key)?;
    let executor = connection::shared_executor()?;

    Ok(Connection::with_callback(config, socket, executor, callback))
}

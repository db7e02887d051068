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

//! Binding a remote certificate to a [`PeerId`].
//!
//! A certificate only proves that its sender holds the key embedded in it. The
//! [`PeerId`] is derived from that key, and the certificate's Common Name must
//! match it exactly; otherwise a peer could present a self-signed certificate
//! claiming somebody else's identity.

use libp2p_identity::{rsa, DecodingError, PeerId, PublicKey};
use rustls::pki_types::CertificateDer;

use crate::certificate::{self, SelfSignedCertificate};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Failed to parse certificate")]
    BadCertificate(#[from] certificate::ParseError),
    #[error("Certificate has no Common Name")]
    MissingCommonName,
    #[error("Certificate key is not a supported RSA public key")]
    UnsupportedKey(#[source] DecodingError),
    #[error("Certificate claims to belong to {claimed} but its key belongs to {derived}")]
    IdentityMismatch { claimed: String, derived: PeerId },
}

/// Returns the identity the remote's certificate proves.
///
/// The returned [`PeerId`] is the one derived from the certificate's key, never
/// the claimed Common Name.
pub fn resolve(certificate: &CertificateDer<'_>) -> Result<PeerId, ResolveError> {
    let certificate = certificate::parse(certificate)?;

    resolve_parsed(&certificate)
}

pub(crate) fn resolve_parsed(
    certificate: &SelfSignedCertificate<'_>,
) -> Result<PeerId, ResolveError> {
    let claimed = certificate
        .common_name()
        .ok_or(ResolveError::MissingCommonName)?;
    let derived = derive_peer_id(certificate.subject_public_key_info())?;

    if claimed != derived.to_base58() {
        return Err(ResolveError::IdentityMismatch {
            claimed: claimed.to_owned(),
            derived,
        });
    }

    tracing::trace!(peer=%derived, "certificate identity confirmed");

    Ok(derived)
}

/// Same derivation local identities are built with: the [`PeerId`] of the RSA
/// public key.
fn derive_peer_id(subject_public_key_info: &[u8]) -> Result<PeerId, ResolveError> {
    let public_key = rsa::PublicKey::try_decode_x509(subject_public_key_info)
        .map_err(ResolveError::UnsupportedKey)?;

    Ok(PublicKey::from(public_key).to_peer_id())
}

#[cfg(test)]
mod tests {
    use libp2p_identity::Keypair;

    use super::*;

    const ALICE: &[u8] = include_bytes!("./test_assets/rsa_alice.pk8");
    const MALLORY: &[u8] = include_bytes!("./test_assets/rsa_mallory.pk8");

    fn peer_id(pkcs8: &[u8]) -> PeerId {
        Keypair::rsa_from_pkcs8(&mut pkcs8.to_vec())
            .unwrap()
            .public()
            .to_peer_id()
    }

    #[test]
    fn resolves_to_the_key_owner() {
        let alice = peer_id(ALICE);
        let issued = certificate::generate(&alice, ALICE).unwrap();

        assert_eq!(resolve(&issued.certificate_der()).unwrap(), alice);
    }

    #[test]
    fn tolerates_a_remote_clock_running_ahead() {
        let alice = peer_id(ALICE);
        let issued = certificate::generate_at(
            &alice,
            ALICE,
            time::OffsetDateTime::now_utc() + time::Duration::seconds(2),
        )
        .unwrap();

        assert_eq!(resolve(&issued.certificate_der()).unwrap(), alice);
    }

    #[test]
    fn rejects_a_lying_common_name() {
        let alice = peer_id(ALICE);
        let mallory = peer_id(MALLORY);

        // Validly self-signed by Mallory, but claiming to be Alice.
        let issued = certificate::generate_with_common_name(
            &alice.to_base58(),
            MALLORY,
            time::OffsetDateTime::now_utc(),
        )
        .unwrap();

        match resolve(&issued.certificate_der()) {
            Err(ResolveError::IdentityMismatch { claimed, derived }) => {
                assert_eq!(claimed, alice.to_base58());
                assert_eq!(derived, mallory);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_an_arbitrary_common_name() {
        let issued = certificate::generate_with_common_name(
            "peer-X",
            MALLORY,
            time::OffsetDateTime::now_utc(),
        )
        .unwrap();

        assert!(matches!(
            resolve(&issued.certificate_der()),
            Err(ResolveError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn rejects_garbage() {
        let der = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00]);

        assert!(matches!(
            resolve(&der),
            Err(ResolveError::BadCertificate(_))
        ));
    }
}

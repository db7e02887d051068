// Copyright 2021 Parity Technologies (UK) Ltd.
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

//! X.509 certificate handling
//!
//! This module handles generation, signing, and verification of the
//! identity-bound certificates. A certificate is self-signed with the host's
//! own RSA key and carries the host's [`PeerId`] as its Common Name.

use libp2p_identity::PeerId;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use ::time::{Duration, OffsetDateTime};
use x509_parser::{oid_registry::*, prelude::*};

/// The host key is used directly to sign its certificate.
static SIGNATURE_ALGORITHM: &rcgen::SignatureAlgorithm = &rcgen::PKCS_RSA_SHA256;

/// Certificates are single-use and never chained, so they all share one serial.
const SERIAL_NUMBER: u64 = 1;

/// A freshly issued certificate together with the key material it was made from.
///
/// Every connection attempt gets its own instance, which is dropped once the
/// TLS handshake is over.
pub struct IssuedCertificate {
    public_key_pem: String,
    private_key_pem: String,
    certificate_pem: String,
    certificate: CertificateDer<'static>,
    private_key: PrivatePkcs8KeyDer<'static>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl IssuedCertificate {
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub(crate) fn certificate_der(&self) -> CertificateDer<'static> {
        self.certificate.clone()
    }

    pub(crate) fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.private_key.clone_key())
    }
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct GenError(#[from] rcgen::Error);

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ParseError(#[from] pub(crate) webpki::Error);

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct VerificationError(#[from] pub(crate) webpki::Error);

/// Generates a self-signed TLS certificate for `peer_id`, signed with the
/// RSA host key given in PKCS#8 DER form.
///
/// The certificate is valid for one year starting now.
pub fn generate(peer_id: &PeerId, private_key: &[u8]) -> Result<IssuedCertificate, GenError> {
    generate_at(peer_id, private_key, OffsetDateTime::now_utc())
}

pub(crate) fn generate_at(
    peer_id: &PeerId,
    private_key: &[u8],
    now: OffsetDateTime,
) -> Result<IssuedCertificate, GenError> {
    generate_with_common_name(&peer_id.to_base58(), private_key, now)
}

/// Issues a certificate whose Common Name is `common_name`, whatever key signs it.
pub(crate) fn generate_with_common_name(
    common_name: &str,
    private_key: &[u8],
    now: OffsetDateTime,
) -> Result<IssuedCertificate, GenError> {
    let private_key = PrivatePkcs8KeyDer::from(private_key.to_vec());
    let keypair = KeyPair::from_pkcs8_der_and_sign_algo(&private_key, SIGNATURE_ALGORITHM)?;

    // DER validity times have second precision.
    let not_before = now.replace_nanosecond(0).unwrap_or(now);
    let not_after = one_year_after(not_before);

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from(SERIAL_NUMBER));
    params.not_before = not_before;
    params.not_after = not_after;
    params.distinguished_name = distinguished_name(common_name);
    // The certificate acts as its own trust anchor and, depending on the
    // negotiated role, as either a server or a client certificate.
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::ContentCommitment,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let certificate = params.self_signed(&keypair)?;

    Ok(IssuedCertificate {
        public_key_pem: keypair.public_key_pem(),
        private_key_pem: keypair.serialize_pem(),
        certificate_pem: certificate.pem(),
        certificate: certificate.der().clone(),
        private_key,
        not_before,
        not_after,
    })
}

/// Subject and issuer of every certificate. Only the Common Name varies.
fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name.push(DnType::CountryName, "US");
    name.push(DnType::StateOrProvinceName, "Virginia");
    name.push(DnType::LocalityName, "Blacksburg");
    name.push(DnType::OrganizationName, "Test");
    name.push(DnType::OrganizationalUnitName, "Test");
    name
}

/// Same day and time one calendar year later. February 29th falls back to 365 days.
fn one_year_after(instant: OffsetDateTime) -> OffsetDateTime {
    instant
        .replace_year(instant.year() + 1)
        .unwrap_or(instant + Duration::days(365))
}

/// Attempts to parse the provided bytes as a [`SelfSignedCertificate`].
///
/// For this to succeed, the certificate must be currently valid, self-issued and
/// carry a signature made by its own embedded key.
pub fn parse<'a>(certificate: &'a CertificateDer<'a>) -> Result<SelfSignedCertificate<'a>, ParseError> {
    let certificate = parse_unverified(certificate.as_ref())?;

    certificate.verify()?;

    Ok(certificate)
}

fn parse_unverified(der_input: &[u8]) -> Result<SelfSignedCertificate, webpki::Error> {
    let x509 = X509Certificate::from_der(der_input)
        .map(|(_rest_input, x509)| x509)
        .map_err(|_| webpki::Error::BadDer)?;

    Ok(SelfSignedCertificate { certificate: x509 })
}

/// A self-signed X.509 certificate binding a Common Name to an RSA key.
pub struct SelfSignedCertificate<'a> {
    certificate: X509Certificate<'a>,
}

impl SelfSignedCertificate<'_> {
    /// The identity the certificate claims, i.e. its subject Common Name.
    pub fn common_name(&self) -> Option<&str> {
        self.certificate
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
    }

    /// The DER encoded SubjectPublicKeyInfo of the embedded key.
    pub fn subject_public_key_info(&self) -> &[u8] {
        self.certificate.public_key().raw
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.certificate.validity().not_before.to_datetime()
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.certificate.validity().not_after.to_datetime()
    }

    /// This method validates the integrity of the certificate.
    /// The certificate MUST:
    /// 1. not be expired;
    /// 2. be self-issued;
    /// 3. carry a self-signature that verifies with its own public key.
    ///
    /// `notBefore` is the issuance instant of the remote, so it is not compared
    /// against the local clock. No chain of trust is involved; who the
    /// certificate belongs to is established separately from its public key.
    fn verify(&self) -> Result<(), webpki::Error> {
        use webpki::Error;

        if self.not_after() < OffsetDateTime::now_utc() {
            return Err(Error::InvalidCertValidity);
        }

        if self.certificate.issuer() != self.certificate.subject() {
            return Err(Error::UnknownIssuer);
        }

        let signature_scheme = self.signature_scheme()?;
        let raw_certificate = self.certificate.tbs_certificate.as_ref();
        let signature: &[u8] = self.certificate.signature_value.data.as_ref();
        self.verify_signature(signature_scheme, raw_certificate, signature)
            .map_err(|_| Error::SignatureAlgorithmMismatch)?;

        Ok(())
    }

    /// Return the signature scheme the certificate was signed with.
    ///
    /// Only RSA keys are supported, and hash functions with an output length
    /// less than 256 bits MUST NOT be used.
    pub fn signature_scheme(&self) -> Result<rustls::SignatureScheme, webpki::Error> {
        use rustls::SignatureScheme::*;

        self.ensure_rsa_key()?;

        let signature_algorithm = &self.certificate.signature_algorithm.algorithm;
        if *signature_algorithm == OID_PKCS1_SHA256WITHRSA {
            return Ok(RSA_PKCS1_SHA256);
        }
        if *signature_algorithm == OID_PKCS1_SHA384WITHRSA {
            return Ok(RSA_PKCS1_SHA384);
        }
        if *signature_algorithm == OID_PKCS1_SHA512WITHRSA {
            return Ok(RSA_PKCS1_SHA512);
        }

        Err(webpki::Error::UnsupportedSignatureAlgorithm)
    }

    fn ensure_rsa_key(&self) -> Result<(), webpki::Error> {
        let pki_algorithm = &self.certificate.tbs_certificate.subject_pki.algorithm;
        if pki_algorithm.algorithm != OID_PKCS1_RSAENCRYPTION {
            return Err(webpki::Error::UnsupportedSignatureAlgorithmForPublicKey);
        }

        Ok(())
    }

    /// Get a [`ring::signature::UnparsedPublicKey`] for this `signature_scheme`.
    /// Return `Error` if the embedded key cannot produce `signature_scheme`
    /// signatures or if the `signature_scheme` is not supported.
    ///
    /// The scheme may differ from the one the certificate itself was signed
    /// with: TLS 1.3 handshakes use RSA-PSS with the same key.
    pub fn public_key(
        &self,
        signature_scheme: rustls::SignatureScheme,
    ) -> Result<ring::signature::UnparsedPublicKey<&[u8]>, webpki::Error> {
        use ring::signature;
        use rustls::SignatureScheme::*;

        self.ensure_rsa_key()?;

        let verification_algorithm: &dyn signature::VerificationAlgorithm = match signature_scheme {
            RSA_PKCS1_SHA256 => &signature::RSA_PKCS1_2048_8192_SHA256,
            RSA_PKCS1_SHA384 => &signature::RSA_PKCS1_2048_8192_SHA384,
            RSA_PKCS1_SHA512 => &signature::RSA_PKCS1_2048_8192_SHA512,
            RSA_PSS_SHA256 => &signature::RSA_PSS_2048_8192_SHA256,
            RSA_PSS_SHA384 => &signature::RSA_PSS_2048_8192_SHA384,
            RSA_PSS_SHA512 => &signature::RSA_PSS_2048_8192_SHA512,
            _ => return Err(webpki::Error::UnsupportedSignatureAlgorithmForPublicKey),
        };
        let spki = &self.certificate.tbs_certificate.subject_pki;
        let key = signature::UnparsedPublicKey::new(
            verification_algorithm,
            spki.subject_public_key.data.as_ref(),
        );

        Ok(key)
    }

    /// Verify the `signature` of the `message` signed by the private key corresponding to the public key stored
    /// in the certificate.
    pub fn verify_signature(
        &self,
        signature_scheme: rustls::SignatureScheme,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), VerificationError> {
        let pk = self.public_key(signature_scheme)?;
        pk.verify(message, signature)
            .map_err(|_| webpki::Error::InvalidSignatureForPublicKey)?;

        Ok(())
    }
}

//! Code-signing verification for loadable module images.
//!
//! A signed module carries an embedded [`SignatureBlock`]: a DER structure
//! holding the payload digest, the signing certificate chain, and an
//! RSA-PKCS#1v1.5 signature over the loadable payload. Verification walks
//! the chain up to the [`TrustStore`] (plus an optional supplemental store)
//! at the validation time, and additionally requires the signing certificate
//! to carry code-signing capability and the vendor "Dev ID" extension OIDs,
//! each flagged critical. Absence or non-criticality of a required extension
//! is a verification failure, not a warning.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode, Sequence};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use x509_cert::ext::pkix::BasicConstraints;
use x509_cert::Certificate;

use crate::error::{Error, Result};
use crate::truststore::TrustStore;

/// SHA-256 (NIST algorithm registry).
pub const OID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
/// sha256WithRSAEncryption.
pub const OID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
/// X.509 extended key usage extension.
pub const OID_EXT_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37");
/// X.509 basic constraints extension.
pub const OID_BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");
/// Extended key usage purpose: code signing.
pub const OID_KP_CODE_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3");
/// Vendor extension: "Dev ID Application" signing authority.
pub const OID_DEV_ID_APPLICATION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113635.100.6.1.13");
/// Vendor extension: "Dev ID kext" signing authority.
pub const OID_DEV_ID_KEXT: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113635.100.6.1.18");

/// Upper bound on chain length; anything deeper is hostile or broken.
const MAX_CHAIN_DEPTH: usize = 8;

/// The embedded signature structure of a signed module image.
///
/// The signature covers the loadable payload as external data; the
/// certificate list starts with the signing certificate followed by any
/// intermediates, in order.
#[derive(Clone, Debug, Sequence)]
pub struct SignatureBlock {
    /// Digest algorithm used for `payload_digest` (SHA-256 only).
    pub digest_algorithm: ObjectIdentifier,
    /// Signature algorithm (sha256WithRSAEncryption only).
    pub signature_algorithm: ObjectIdentifier,
    /// Digest of the loadable payload.
    pub payload_digest: OctetString,
    /// Signing certificate first, then intermediates.
    pub certificates: Vec<Certificate>,
    /// RSA-PKCS#1v1.5 signature over the loadable payload.
    pub signature: OctetString,
}

/// Verifies module signatures against a trust store.
pub struct ImageVerifier {
    trust: Arc<TrustStore>,
    supplemental: Option<Arc<TrustStore>>,
}

impl ImageVerifier {
    pub fn new(trust: Arc<TrustStore>, supplemental: Option<Arc<TrustStore>>) -> Self {
        Self { trust, supplemental }
    }

    /// Verifies `signature_der` over `payload` as of the current time.
    pub fn verify(&self, image_name: &str, payload: &[u8], signature_der: &[u8]) -> Result<()> {
        self.verify_at(image_name, payload, signature_der, SystemTime::now())
    }

    /// Verifies at an explicit validation time. Deterministic: the same
    /// stores, payload, signature, and time always yield the same outcome.
    pub fn verify_at(
        &self,
        image_name: &str,
        payload: &[u8],
        signature_der: &[u8],
        now: SystemTime,
    ) -> Result<()> {
        let block = SignatureBlock::from_der(signature_der)?;

        if block.digest_algorithm != OID_SHA256 || block.signature_algorithm != OID_SHA256_WITH_RSA
        {
            warn!(
                image = image_name,
                digest = %block.digest_algorithm,
                signature = %block.signature_algorithm,
                "unsupported signature algorithms"
            );
            return Err(Error::NotSupported);
        }

        let digest = Sha256::digest(payload);
        if !bool::from(digest.as_slice().ct_eq(block.payload_digest.as_bytes())) {
            warn!(image = image_name, "payload digest mismatch");
            return Err(Error::LoaderMismatch(format!("payload digest mismatch for {image_name}")));
        }

        let leaf = block
            .certificates
            .first()
            .ok_or_else(|| Error::AccessDenied("signature carries no certificates".into()))?;

        let key = public_key_of(leaf)?;
        let verifying_key = VerifyingKey::<Sha256>::new(key);
        let signature = Signature::try_from(block.signature.as_bytes())
            .map_err(|e| Error::AccessDenied(format!("malformed signature: {e}")))?;
        verifying_key.verify(payload, &signature).map_err(|_| {
            warn!(image = image_name, "payload signature verification failed");
            Error::LoaderMismatch(format!("signature does not match payload of {image_name}"))
        })?;

        self.verify_chain(&block.certificates, now)?;
        check_signing_cert_policy(leaf)?;

        debug!(
            image = image_name,
            signer = %leaf.tbs_certificate.subject,
            "image signature verified"
        );
        Ok(())
    }

    /// Walks from the signing certificate to a trust anchor, verifying each
    /// link's signature and validity window.
    fn verify_chain(&self, chain: &[Certificate], now: SystemTime) -> Result<()> {
        let mut current = &chain[0];
        for _depth in 0..MAX_CHAIN_DEPTH {
            check_validity(current, now)?;

            // A certificate that is itself an anchor terminates the walk.
            if self.is_anchor(current)? {
                return Ok(());
            }

            let issuer_name = &current.tbs_certificate.issuer;
            if let Some(anchor) = self.find_anchor(issuer_name) {
                check_validity(anchor, now)?;
                verify_signed_by(current, anchor)?;
                return Ok(());
            }

            let issuer = chain[1..]
                .iter()
                .find(|c| c.tbs_certificate.subject == *issuer_name)
                .ok_or_else(|| {
                    Error::AccessDenied(format!("no path to a trust anchor from '{issuer_name}'"))
                })?;
            require_ca(issuer)?;
            verify_signed_by(current, issuer)?;
            current = issuer;
        }
        Err(Error::AccessDenied("certificate chain too deep".into()))
    }

    fn find_anchor(&self, name: &x509_cert::name::Name) -> Option<&Certificate> {
        self.trust
            .find_by_subject(name)
            .or_else(|| self.supplemental.as_ref().and_then(|s| s.find_by_subject(name)))
    }

    fn is_anchor(&self, cert: &Certificate) -> Result<bool> {
        let der = cert.to_der()?;
        Ok(self.trust.contains_der(&der)
            || self.supplemental.as_ref().is_some_and(|s| s.contains_der(&der)))
    }
}

fn public_key_of(cert: &Certificate) -> Result<RsaPublicKey> {
    let spki = cert.tbs_certificate.subject_public_key_info.to_der()?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| Error::AccessDenied(format!("unusable subject public key: {e}")))
}

fn verify_signed_by(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    if cert.signature_algorithm.oid != OID_SHA256_WITH_RSA {
        return Err(Error::NotSupported);
    }
    let key = public_key_of(issuer)?;
    let verifying_key = VerifyingKey::<Sha256>::new(key);
    let tbs = cert.tbs_certificate.to_der()?;
    let sig_bytes = cert
        .signature
        .as_bytes()
        .ok_or_else(|| Error::AccessDenied("unaligned certificate signature".into()))?;
    let signature = Signature::try_from(sig_bytes)
        .map_err(|e| Error::AccessDenied(format!("malformed certificate signature: {e}")))?;
    verifying_key.verify(&tbs, &signature).map_err(|_| {
        Error::AccessDenied(format!(
            "certificate '{}' is not signed by '{}'",
            cert.tbs_certificate.subject, issuer.tbs_certificate.subject
        ))
    })
}

fn check_validity(cert: &Certificate, now: SystemTime) -> Result<()> {
    let validity = &cert.tbs_certificate.validity;
    let now = now
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::Internal("validation time precedes the epoch".into()))?;
    if now < validity.not_before.to_unix_duration() || now > validity.not_after.to_unix_duration()
    {
        return Err(Error::AccessDenied(format!(
            "certificate '{}' is outside its validity window",
            cert.tbs_certificate.subject
        )));
    }
    Ok(())
}

/// Issuers inside the chain must be CA certificates.
fn require_ca(cert: &Certificate) -> Result<()> {
    let Some(exts) = &cert.tbs_certificate.extensions else {
        return Err(Error::AccessDenied(format!(
            "issuer '{}' has no basic constraints",
            cert.tbs_certificate.subject
        )));
    };
    for ext in exts {
        if ext.extn_id == OID_BASIC_CONSTRAINTS {
            let bc = BasicConstraints::from_der(ext.extn_value.as_bytes())?;
            if bc.ca {
                return Ok(());
            }
            break;
        }
    }
    Err(Error::AccessDenied(format!(
        "issuer '{}' is not a CA certificate",
        cert.tbs_certificate.subject
    )))
}

/// Enforces the signing-certificate policy: standard code-signing capability
/// plus the vendor "Dev ID" extensions, each of which must be critical.
fn check_signing_cert_policy(cert: &Certificate) -> Result<()> {
    let subject = &cert.tbs_certificate.subject;
    let exts = cert.tbs_certificate.extensions.as_deref().unwrap_or(&[]);

    let mut has_code_signing = false;
    let mut dev_id_app = 0u32;
    let mut dev_id_kext = 0u32;

    for ext in exts {
        if ext.extn_id == OID_EXT_KEY_USAGE {
            let purposes = Vec::<ObjectIdentifier>::from_der(ext.extn_value.as_bytes())?;
            has_code_signing = purposes.contains(&OID_KP_CODE_SIGNING);
        } else if ext.extn_id == OID_DEV_ID_APPLICATION {
            dev_id_app += 1;
            if !ext.critical {
                return Err(Error::AccessDenied(format!(
                    "'{subject}': Dev ID Application extension is not flagged critical"
                )));
            }
        } else if ext.extn_id == OID_DEV_ID_KEXT {
            dev_id_kext += 1;
            if !ext.critical {
                return Err(Error::AccessDenied(format!(
                    "'{subject}': Dev ID kext extension is not flagged critical"
                )));
            }
        }
    }

    if !has_code_signing {
        return Err(Error::AccessDenied(format!(
            "'{subject}' lacks the code-signing extended key usage"
        )));
    }
    if dev_id_app == 0 {
        return Err(Error::AccessDenied(format!(
            "'{subject}' is missing the 'Dev ID Application' extension"
        )));
    }
    if dev_id_kext == 0 {
        return Err(Error::AccessDenied(format!(
            "'{subject}' is missing the 'Dev ID kext' extension"
        )));
    }
    Ok(())
}

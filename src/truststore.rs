//! The certificate trust store.
//!
//! An append-only-at-init set of DER-encoded trust anchors (trusted
//! authorities plus the embedded build certificate). Immutable after
//! construction and shared by `Arc`; consulted only by the image verifier.

use der::Decode;
use x509_cert::name::Name;
use x509_cert::Certificate;

use crate::error::Result;

struct Anchor {
    der: Vec<u8>,
    cert: Certificate,
}

/// Immutable set of certificates used to verify signed module images.
pub struct TrustStore {
    anchors: Vec<Anchor>,
}

impl TrustStore {
    pub fn builder() -> TrustStoreBuilder {
        TrustStoreBuilder { anchors: Vec::new() }
    }

    /// An empty store; verification against it rejects everything.
    pub fn empty() -> Self {
        Self { anchors: Vec::new() }
    }

    /// Finds a trust anchor whose subject matches `name`.
    pub fn find_by_subject(&self, name: &Name) -> Option<&Certificate> {
        self.anchors.iter().find(|a| a.cert.tbs_certificate.subject == *name).map(|a| &a.cert)
    }

    /// Whether the exact DER encoding is one of the anchors.
    pub fn contains_der(&self, der: &[u8]) -> bool {
        self.anchors.iter().any(|a| a.der == der)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// Builder collecting anchors before the store is frozen.
pub struct TrustStoreBuilder {
    anchors: Vec<Anchor>,
}

impl TrustStoreBuilder {
    /// Adds a trusted authority certificate (root or intermediate pinned as
    /// an anchor), rejecting DER that does not parse as a certificate.
    pub fn add_anchor_der(mut self, der: &[u8]) -> Result<Self> {
        let cert = Certificate::from_der(der)?;
        self.anchors.push(Anchor { der: der.to_vec(), cert });
        Ok(self)
    }

    /// Adds the build certificate shipped inside the driver. It is an
    /// ordinary anchor; the distinction only matters to packaging.
    pub fn add_build_certificate_der(self, der: &[u8]) -> Result<Self> {
        self.add_anchor_der(der)
    }

    pub fn build(self) -> TrustStore {
        TrustStore { anchors: self.anchors }
    }
}

//! Shared fixtures: a synthetic signing PKI and signed ELF module builders.
#![allow(dead_code)]

use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use der::asn1::{BitString, ObjectIdentifier, OctetString};
use der::{Any, Encode, Tag};
use object::write::{Object as ObjWriter, Relocation, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, RelocationKind, SectionKind,
    SymbolFlags, SymbolKind, SymbolScope,
};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use x509_cert::certificate::{TbsCertificate, Version};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::Validity;
use x509_cert::Certificate;

use supdrv::loader::verify::{
    SignatureBlock, OID_BASIC_CONSTRAINTS, OID_DEV_ID_APPLICATION, OID_DEV_ID_KEXT,
    OID_EXT_KEY_USAGE, OID_KP_CODE_SIGNING, OID_SHA256, OID_SHA256_WITH_RSA,
};
use supdrv::loader::SIGNATURE_SECTION;

// 2048-bit keygen is the slow part; generate once per process.
fn keys() -> &'static [RsaPrivateKey; 3] {
    static KEYS: OnceLock<[RsaPrivateKey; 3]> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        [
            RsaPrivateKey::new(&mut rng, 2048).expect("keygen"),
            RsaPrivateKey::new(&mut rng, 2048).expect("keygen"),
            RsaPrivateKey::new(&mut rng, 2048).expect("keygen"),
        ]
    })
}

fn rsa_alg() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: OID_SHA256_WITH_RSA,
        parameters: Some(Any::new(Tag::Null, []).expect("null parameters")),
    }
}

fn spki_of(key: &RsaPrivateKey) -> SubjectPublicKeyInfoOwned {
    let der = key.to_public_key().to_public_key_der().expect("spki");
    use der::Decode;
    SubjectPublicKeyInfoOwned::from_der(der.as_bytes()).expect("spki decode")
}

fn basic_constraints_ext(ca: bool) -> Extension {
    use x509_cert::ext::pkix::BasicConstraints;
    let value = BasicConstraints { ca, path_len_constraint: None }.to_der().expect("bc");
    Extension {
        extn_id: OID_BASIC_CONSTRAINTS,
        critical: true,
        extn_value: OctetString::new(value).expect("bc value"),
    }
}

fn eku_ext(purposes: &[ObjectIdentifier]) -> Extension {
    let value = purposes.to_vec().to_der().expect("eku");
    Extension {
        extn_id: OID_EXT_KEY_USAGE,
        critical: false,
        extn_value: OctetString::new(value).expect("eku value"),
    }
}

fn marker_ext(oid: ObjectIdentifier, critical: bool) -> Extension {
    let value = der::asn1::Null.to_der().expect("null");
    Extension { extn_id: oid, critical, extn_value: OctetString::new(value).expect("marker") }
}

fn issue(
    subject: &str,
    issuer: &str,
    subject_key: &RsaPrivateKey,
    issuer_key: &RsaPrivateKey,
    serial: u8,
    extensions: Vec<Extension>,
) -> Certificate {
    let tbs = TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(&[serial]).expect("serial"),
        signature: rsa_alg(),
        issuer: Name::from_str(issuer).expect("issuer name"),
        validity: Validity::from_now(Duration::from_secs(3600)).expect("validity"),
        subject: Name::from_str(subject).expect("subject name"),
        subject_public_key_info: spki_of(subject_key),
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    };
    let tbs_der = tbs.to_der().expect("tbs");
    let signature = SigningKey::<Sha256>::new(issuer_key.clone()).sign(&tbs_der);
    Certificate {
        tbs_certificate: tbs,
        signature_algorithm: rsa_alg(),
        signature: BitString::from_bytes(&signature.to_bytes()).expect("signature bits"),
    }
}

/// A CA (root or intermediate) in the test hierarchy.
pub struct Authority {
    pub cert: Certificate,
    pub name: &'static str,
    key_index: usize,
}

impl Authority {
    pub fn key(&self) -> &'static RsaPrivateKey {
        &keys()[self.key_index]
    }

    pub fn der(&self) -> Vec<u8> {
        self.cert.to_der().expect("cert der")
    }
}

/// Self-signed root CA.
pub fn root() -> Authority {
    let name = "CN=Test Signing Root";
    let cert = issue(name, name, &keys()[0], &keys()[0], 1, vec![basic_constraints_ext(true)]);
    Authority { cert, name, key_index: 0 }
}

/// Intermediate CA below `parent`.
pub fn intermediate(parent: &Authority) -> Authority {
    let name = "CN=Test Signing CA";
    let cert =
        issue(name, parent.name, &keys()[1], parent.key(), 2, vec![basic_constraints_ext(true)]);
    Authority { cert, name, key_index: 1 }
}

/// Which extensions the signing certificate carries.
pub struct LeafProfile {
    pub code_signing: bool,
    /// None omits the extension; Some(critical) includes it.
    pub dev_id_application: Option<bool>,
    pub dev_id_kext: Option<bool>,
}

impl LeafProfile {
    /// A leaf that satisfies the full signing policy.
    pub fn good() -> Self {
        Self { code_signing: true, dev_id_application: Some(true), dev_id_kext: Some(true) }
    }
}

/// Signing certificate below `parent`, per the given profile.
pub fn leaf(parent: &Authority, profile: &LeafProfile) -> (Certificate, &'static RsaPrivateKey) {
    let mut extensions = vec![basic_constraints_ext(false)];
    if profile.code_signing {
        extensions.push(eku_ext(&[OID_KP_CODE_SIGNING]));
    }
    if let Some(critical) = profile.dev_id_application {
        extensions.push(marker_ext(OID_DEV_ID_APPLICATION, critical));
    }
    if let Some(critical) = profile.dev_id_kext {
        extensions.push(marker_ext(OID_DEV_ID_KEXT, critical));
    }
    let cert = issue("CN=Test Module Signer", parent.name, &keys()[2], parent.key(), 3, extensions);
    (cert, &keys()[2])
}

/// Builds the DER signature block over `payload`, signed by `key`, carrying
/// `certificates` (leaf first).
pub fn signature_block(
    payload: &[u8],
    certificates: Vec<Certificate>,
    key: &RsaPrivateKey,
) -> Vec<u8> {
    let signature = SigningKey::<Sha256>::new(key.clone()).sign(payload);
    SignatureBlock {
        digest_algorithm: OID_SHA256,
        signature_algorithm: OID_SHA256_WITH_RSA,
        payload_digest: OctetString::new(Sha256::digest(payload).to_vec()).expect("digest"),
        certificates,
        signature: OctetString::new(signature.to_bytes().to_vec()).expect("signature"),
    }
    .to_der()
    .expect("signature block")
}

/// A small relocatable module: 8 bytes of text exported as `export`, and if
/// `import` is given, an 8-byte slot fixed up against that symbol.
pub fn build_module_with(
    export: &str,
    import: Option<&str>,
    signature: Option<&[u8]>,
) -> Vec<u8> {
    build_module_inner(export, import, 8, signature)
}

fn build_module_inner(
    export: &str,
    import: Option<&str>,
    reloc_offset: u64,
    signature: Option<&[u8]>,
) -> Vec<u8> {
    let mut obj = ObjWriter::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &[0x90u8; 8], 16);

    obj.add_symbol(Symbol {
        name: export.as_bytes().to_vec(),
        value: 0,
        size: 8,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    if let Some(import) = import {
        obj.append_section_data(text, &[0u8; 8], 8);
        let import = obj.add_symbol(Symbol {
            name: import.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Unknown,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        obj.add_relocation(
            text,
            Relocation {
                offset: reloc_offset,
                symbol: import,
                addend: 0,
                flags: RelocationFlags::Generic {
                    kind: RelocationKind::Absolute,
                    encoding: object::RelocationEncoding::Generic,
                    size: 64,
                },
            },
        )
        .expect("relocation");
    }

    if let Some(signature) = signature {
        let sig = obj.add_section(
            Vec::new(),
            SIGNATURE_SECTION.as_bytes().to_vec(),
            SectionKind::Note,
        );
        obj.append_section_data(sig, signature, 1);
    }
    obj.write().expect("module bytes")
}

/// The default module: exports `mod_entry`, imports `sup_log`.
pub fn build_module(signature: Option<&[u8]>) -> Vec<u8> {
    build_module_with("mod_entry", Some("sup_log"), signature)
}

/// The default module with its import fixup recorded far outside the image.
/// The relocation table sits outside the signed payload, so the signature
/// over this module is just as valid as the default one's.
pub fn build_module_bad_reloc(signature: Option<&[u8]>) -> Vec<u8> {
    build_module_inner("mod_entry", Some("sup_log"), 0x10_0000, signature)
}

/// Signs a module built by `build` under the given authority chain.
pub fn sign_with_chain(
    build: impl Fn(Option<&[u8]>) -> Vec<u8>,
    chain: Vec<Certificate>,
    key: &RsaPrivateKey,
) -> (Vec<u8>, u64) {
    let unsigned = build(None);
    let payload = supdrv::loader::elf::signed_payload(&unsigned).expect("payload");
    let block = signature_block(&payload, chain, key);
    let module = build(Some(&block));
    let size = supdrv::loader::elf::image_size(&module).expect("size");
    (module, size)
}

/// A fully signed default module plus its expected in-memory image size,
/// using the root → intermediate → leaf chain and a policy-satisfying leaf.
pub fn signed_module() -> (Vec<u8>, u64, Authority) {
    let root = root();
    let inter = intermediate(&root);
    let (leaf_cert, leaf_key) = leaf(&inter, &LeafProfile::good());
    let (module, size) =
        sign_with_chain(build_module, vec![leaf_cert, inter.cert.clone()], leaf_key);
    (module, size, root)
}

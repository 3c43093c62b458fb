use std::cell::RefCell;
use std::rc::Rc;

use der::Encode;
use p256::ecdsa::signature::Verifier;
use rsa::pkcs8::DecodePublicKey;

use super::software::SoftwareProviderFactory;
use super::*;
use crate::adapter::StaticAdapterDirectory;
use crate::error::{error_codes, ErrorKind, KmsError};
use crate::identity::EcCurve;

fn ep(unit: u8, subunit: u16) -> Endpoint {
    Endpoint::new(unit, subunit)
}

/// Factory that records open attempts and fails for selected endpoints
struct RecordingFactory {
    failing: Vec<Endpoint>,
    opened: Rc<RefCell<Vec<Endpoint>>>,
}

impl ProviderFactory for RecordingFactory {
    fn open(&self, family: AdapterFamily, endpoint: Endpoint) -> KmsResult<Box<dyn CryptoProvider>> {
        self.opened.borrow_mut().push(endpoint);
        if self.failing.contains(&endpoint) {
            return Err(KmsError::provider_error("open", "token busy", error_codes::PROVIDER_LOAD_FAILED));
        }
        SoftwareProviderFactory::new().open(family, endpoint)
    }
}

fn recording(failing: Vec<Endpoint>) -> (RecordingFactory, Rc<RefCell<Vec<Endpoint>>>) {
    let opened = Rc::new(RefCell::new(Vec::new()));
    (
        RecordingFactory {
            failing,
            opened: opened.clone(),
        },
        opened,
    )
}

#[test]
fn test_cross_checked_binds_lowest_online_endpoint() {
    let mut directory = StaticAdapterDirectory::new()
        .with_adapter(ep(5, 1), AdapterFamily::Cca, 7)
        .with_adapter(ep(2, 1), AdapterFamily::Cca, 7)
        .with_adapter(ep(3, 1), AdapterFamily::Cca, 7);
    directory.set_online(ep(2, 1), false);

    let (factory, opened) = recording(vec![]);
    let mut binding = ProviderBinding::new();
    binding
        .bind(AdapterFamily::Cca, &[ep(5, 1), ep(2, 1), ep(3, 1)], &directory, &factory)
        .unwrap();

    assert!(binding.is_bound());
    assert_eq!(binding.bound_endpoint(), Some(ep(3, 1)));
    assert_eq!(*opened.borrow(), vec![ep(3, 1)]);
}

#[test]
fn test_cross_checked_refuses_inconsistent_master_keys() {
    let directory = StaticAdapterDirectory::new()
        .with_adapter(ep(1, 1), AdapterFamily::Cca, 7)
        .with_adapter(ep(2, 1), AdapterFamily::Cca, 8);

    let (factory, opened) = recording(vec![]);
    let mut binding = ProviderBinding::new();
    let err = binding
        .bind(AdapterFamily::Cca, &[ep(1, 1), ep(2, 1)], &directory, &factory)
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InconsistentAdapterSetup);
    assert!(!binding.is_bound());
    assert!(opened.borrow().is_empty());
}

#[test]
fn test_cross_checked_open_failure_is_returned() {
    let directory = StaticAdapterDirectory::new()
        .with_adapter(ep(1, 1), AdapterFamily::Cca, 7)
        .with_adapter(ep(2, 1), AdapterFamily::Cca, 7);

    let (factory, opened) = recording(vec![ep(1, 1)]);
    let mut binding = ProviderBinding::new();
    let err = binding
        .bind(AdapterFamily::Cca, &[ep(1, 1), ep(2, 1)], &directory, &factory)
        .unwrap_err();

    assert_eq!(err.error_code(), error_codes::PROVIDER_LOAD_FAILED);
    assert_eq!(*opened.borrow(), vec![ep(1, 1)]);
}

#[test]
fn test_first_available_skips_failures_in_order() {
    let mut directory = StaticAdapterDirectory::new()
        .with_adapter(ep(4, 2), AdapterFamily::Ep11, 0)
        .with_adapter(ep(1, 2), AdapterFamily::Ep11, 0)
        .with_adapter(ep(2, 2), AdapterFamily::Ep11, 0);
    directory.set_online(ep(1, 2), false);

    let (factory, opened) = recording(vec![ep(4, 2)]);
    let mut binding = ProviderBinding::new();
    binding
        .bind(AdapterFamily::Ep11, &[ep(4, 2), ep(1, 2), ep(2, 2)], &directory, &factory)
        .unwrap();

    assert_eq!(binding.bound_endpoint(), Some(ep(2, 2)));
    assert_eq!(*opened.borrow(), vec![ep(4, 2), ep(2, 2)]);
}

#[test]
fn test_first_available_reports_no_endpoint() {
    let directory = StaticAdapterDirectory::new().with_adapter(ep(1, 2), AdapterFamily::Ep11, 0);

    let (factory, _) = recording(vec![ep(1, 2)]);
    let mut binding = ProviderBinding::new();
    let err = binding
        .bind(AdapterFamily::Ep11, &[ep(1, 2)], &directory, &factory)
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NoAvailableEndpoint);
    assert!(!binding.is_bound());
}

#[test]
fn test_unbind_is_idempotent() {
    let directory = StaticAdapterDirectory::new().with_adapter(ep(1, 2), AdapterFamily::Ep11, 0);
    let mut binding = ProviderBinding::new();
    binding.unbind();

    binding
        .bind(AdapterFamily::Ep11, &[ep(1, 2)], &directory, &SoftwareProviderFactory::new())
        .unwrap();
    binding.unbind();
    binding.unbind();

    assert!(!binding.is_bound());
    let err = binding.provider().err().unwrap();
    assert_eq!(err.kind(), ErrorKind::IncompleteConfiguration);
}

fn software_provider() -> Box<dyn CryptoProvider> {
    SoftwareProviderFactory::new()
        .open(AdapterFamily::Ep11, ep(1, 1))
        .unwrap()
}

#[test]
fn test_software_ecdsa_signature_verifies() {
    let mut provider = software_provider();
    let blob = provider
        .generate_key(&KeySpec::Ec { curve: EcCurve::P256 })
        .unwrap();

    let spki = provider.public_key(&blob, false).unwrap();
    let verifying_key = p256::ecdsa::VerifyingKey::from_public_key_der(&spki.to_der().unwrap()).unwrap();

    let scheme = SignatureScheme::Ecdsa(DigestAlgorithm::Sha256);
    let signature = provider.sign(&blob, &scheme, b"to be signed").unwrap();
    let signature = p256::ecdsa::DerSignature::try_from(signature.as_slice()).unwrap();

    assert!(verifying_key.verify(b"to be signed", &signature).is_ok());
    assert!(verifying_key.verify(b"something else", &signature).is_err());
}

#[test]
fn test_software_p521_accepts_short_digest() {
    let mut provider = software_provider();
    let blob = provider
        .generate_key(&KeySpec::Ec { curve: EcCurve::P521 })
        .unwrap();

    for digest in [DigestAlgorithm::Sha256, DigestAlgorithm::Sha512] {
        let signature = provider
            .sign(&blob, &SignatureScheme::Ecdsa(digest), b"message")
            .unwrap();
        assert_eq!(signature[0], 0x30);
    }
}

#[test]
fn test_software_rsa_signatures_verify() {
    use rsa::signature::Verifier as _;

    let mut provider = software_provider();
    let blob = provider.generate_key(&KeySpec::Rsa { bits: 1024 }).unwrap();

    let spki = provider.public_key(&blob, false).unwrap();
    let public_key = rsa::RsaPublicKey::from_public_key_der(&spki.to_der().unwrap()).unwrap();

    let signature = provider
        .sign(&blob, &SignatureScheme::RsaPkcs1v15(DigestAlgorithm::Sha256), b"message")
        .unwrap();
    let verifying_key = rsa::pkcs1v15::VerifyingKey::<sha2::Sha256>::new(public_key.clone());
    let signature = rsa::pkcs1v15::Signature::try_from(signature.as_slice()).unwrap();
    assert!(verifying_key.verify(b"message", &signature).is_ok());

    let signature = provider
        .sign(&blob, &SignatureScheme::RsaPss(DigestAlgorithm::Sha256), b"message")
        .unwrap();
    let verifying_key = rsa::pss::VerifyingKey::<sha2::Sha256>::new(public_key);
    let signature = rsa::pss::Signature::try_from(signature.as_slice()).unwrap();
    assert!(verifying_key.verify(b"message", &signature).is_ok());
}

#[test]
fn test_software_pss_public_key_identifier() {
    let mut provider = software_provider();
    let blob = provider.generate_key(&KeySpec::Rsa { bits: 1024 }).unwrap();

    let plain = provider.public_key(&blob, false).unwrap();
    let pss = provider.public_key(&blob, true).unwrap();

    assert_eq!(plain.algorithm.oid, const_oid::db::rfc5912::RSA_ENCRYPTION);
    assert_eq!(pss.algorithm.oid, const_oid::db::rfc5912::ID_RSASSA_PSS);
    assert_eq!(plain.subject_public_key, pss.subject_public_key);
}

#[test]
fn test_software_rejects_mismatched_scheme_and_bad_blob() {
    let mut provider = software_provider();
    let blob = provider
        .generate_key(&KeySpec::Ec { curve: EcCurve::P384 })
        .unwrap();

    let err = provider
        .sign(&blob, &SignatureScheme::RsaPkcs1v15(DigestAlgorithm::Sha256), b"m")
        .unwrap_err();
    assert_eq!(err.error_code(), error_codes::PROVIDER_SIGNING_FAILED);

    let err = provider
        .public_key(&KeyBlob::new(vec![1, 2, 3]), false)
        .unwrap_err();
    assert_eq!(err.error_code(), error_codes::PROVIDER_INVALID_BLOB);
}

#[test]
fn test_key_blob_debug_is_redacted() {
    let blob = KeyBlob::new(vec![0xde, 0xad, 0xbe, 0xef]);
    let debug = format!("{:?}", blob);
    assert!(!debug.contains("222"));
    assert!(debug.contains("4 bytes"));
}

//! Adoption of an externally issued client certificate.

use std::path::Path;

use subtle::ConstantTimeEq;

use super::{install_client_certificate, load_certificate, CertificateAlgorithm, REPLACE_CERT_PROMPT};
use crate::confirm::Confirm;
use crate::error::{KmsError, KmsResult};
use crate::identity::load_identity_key;
use crate::provider::ProviderBinding;
use crate::store::ConfigStore;

/// Install the certificate at `path` as client certificate
///
/// The certificate's public key must be the public key of the identity key:
/// same algorithm identifier and bit-equal key material.
pub fn adopt_client_certificate(
    path: &Path,
    binding: &mut ProviderBinding,
    store: &mut ConfigStore,
    confirm: &mut dyn Confirm,
) -> KmsResult<()> {
    let (blob, key) = load_identity_key(store)?;

    if store.config().client_cert_present() && !confirm.confirm(REPLACE_CERT_PROMPT) {
        return Err(KmsError::cancelled("client certificate adoption"));
    }

    let certificate = load_certificate(path)?;
    let presented = &certificate.tbs_certificate.subject_public_key_info;
    let algorithm = CertificateAlgorithm::classify(presented)?;
    let certificate_name = path.display().to_string();

    if !algorithm.fits(key.algorithm()) {
        log::debug!(
            "Certificate {} holds an {} key, the identity key is {}",
            certificate_name,
            algorithm,
            key
        );
        return Err(KmsError::key_mismatch(&certificate_name));
    }

    let expected = binding
        .signer(&blob)?
        .public_key(algorithm == CertificateAlgorithm::RsaPss)?;

    let same_algorithm = presented.algorithm.oid == expected.algorithm.oid;
    let same_key: bool = presented
        .subject_public_key
        .raw_bytes()
        .ct_eq(expected.subject_public_key.raw_bytes())
        .into();

    if !(same_algorithm && same_key) {
        return Err(KmsError::key_mismatch(&certificate_name));
    }

    install_client_certificate(store, &certificate, algorithm)?;
    log::debug!("Adopted client certificate {}", certificate_name);

    Ok(())
}

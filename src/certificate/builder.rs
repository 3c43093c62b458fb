//! Assembly and signing of certification requests and self-signed certificates.

use std::time::Duration;

use der::asn1::BitString;
use der::pem::LineEnding;
use der::{Encode, EncodePem};
use rand::RngCore;
use x509_cert::attr::Attribute;
use x509_cert::certificate::{Certificate, TbsCertificate, Version};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::request::{CertReq, CertReqInfo, ExtensionReq, Version as RequestVersion};
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Validity;

use super::extensions::ExtensionEntry;
use crate::error::{KmsError, KmsResult};
use crate::provider::{IdentitySigner, SignatureScheme};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Subject, extensions and signature scheme of a certificate to be signed
#[derive(Debug, Clone)]
pub struct SigningInput {
    pub subject: Name,
    pub extensions: Vec<ExtensionEntry>,
    pub scheme: SignatureScheme,
}

fn resolve_extensions(
    entries: &[ExtensionEntry],
    public_key: &spki::SubjectPublicKeyInfoOwned,
) -> KmsResult<Vec<Extension>> {
    entries.iter().map(|e| e.resolve(public_key)).collect()
}

/// Validity period starting now and lasting `days` days
///
/// The end of the period must be encodable as an X.509 time, which ends with
/// the year 9999.
pub fn validity_from_now(days: u32) -> KmsResult<Validity> {
    if days == 0 {
        return Err(KmsError::invalid_request(
            "cert-validity-days",
            "the validity must be at least one day",
        ));
    }
    Validity::from_now(Duration::from_secs(u64::from(days) * SECONDS_PER_DAY)).map_err(|_| {
        KmsError::invalid_request(
            "cert-validity-days",
            &format!("a validity of {} days ends after the year 9999", days),
        )
    })
}

/// A positive 16 byte serial number
fn random_serial() -> KmsResult<SerialNumber> {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    bytes[0] |= 0x01;
    Ok(SerialNumber::new(&bytes)?)
}

/// Build and sign a PKCS #10 request
pub fn build_csr(signer: &mut IdentitySigner<'_>, input: &SigningInput) -> KmsResult<CertReq> {
    let public_key = signer.public_key(input.scheme.is_pss())?;
    let extensions = resolve_extensions(&input.extensions, &public_key)?;

    let mut attributes: Vec<Attribute> = Vec::new();
    if !extensions.is_empty() {
        let request: Attribute = ExtensionReq(extensions).try_into()?;
        attributes.push(request);
    }

    let info = CertReqInfo {
        version: RequestVersion::V1,
        subject: input.subject.clone(),
        public_key,
        attributes: attributes.try_into()?,
    };

    let signature = signer.sign(&input.scheme, &info.to_der()?)?;

    Ok(CertReq {
        info,
        algorithm: input.scheme.algorithm_identifier()?,
        signature: BitString::from_bytes(&signature)?,
    })
}

/// PEM of a request, optionally with the `NEW CERTIFICATE REQUEST` label
pub fn csr_to_pem(request: &CertReq, new_header: bool) -> KmsResult<String> {
    if new_header {
        let der = request.to_der()?;
        der::pem::encode_string("NEW CERTIFICATE REQUEST", LineEnding::LF, &der)
            .map_err(|e| KmsError::SerializationError(e.to_string()))
    } else {
        Ok(request.to_pem(LineEnding::LF)?)
    }
}

/// Build and sign a self-signed certificate valid for `validity_days` from now
pub fn build_self_signed(
    signer: &mut IdentitySigner<'_>,
    input: &SigningInput,
    validity_days: u32,
) -> KmsResult<Certificate> {
    let public_key = signer.public_key(input.scheme.is_pss())?;
    let extensions = resolve_extensions(&input.extensions, &public_key)?;
    let algorithm = input.scheme.algorithm_identifier()?;

    let validity = validity_from_now(validity_days)?;

    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: random_serial()?,
        signature: algorithm.clone(),
        issuer: input.subject.clone(),
        validity,
        subject: input.subject.clone(),
        subject_public_key_info: public_key,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: if extensions.is_empty() { None } else { Some(extensions) },
    };

    let signature = signer.sign(&input.scheme, &tbs_certificate.to_der()?)?;

    Ok(Certificate {
        tbs_certificate,
        signature_algorithm: algorithm,
        signature: BitString::from_bytes(&signature)?,
    })
}

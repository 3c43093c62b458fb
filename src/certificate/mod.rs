/*!
 * Client Certificate Pipeline
 *
 * Produces certification requests and self-signed certificates for the
 * identity key, and adopts externally issued client certificates.
 *
 * Every certificate or request produced here carries the extensions a KMIP
 * client certificate needs: `extendedKeyUsage=clientAuth` and a
 * `subjectAltName` with the local hostname, unless the caller supplied
 * these extensions already.
 */

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use const_oid::db::rfc5912::{ID_EC_PUBLIC_KEY, ID_RSASSA_PSS, RSA_ENCRYPTION};
use der::pem::LineEnding;
use der::{Decode, DecodePem, EncodePem};
use serde::{Deserialize, Serialize};
use spki::SubjectPublicKeyInfoOwned;
use x509_cert::Certificate;

use crate::confirm::Confirm;
use crate::error::{KmsError, KmsResult};
use crate::identity::{generate_identity_key, load_identity_key, KeyAlgorithm, KeySpec};
use crate::provider::{DigestAlgorithm, ProviderBinding, SignatureScheme};
use crate::store::{write_atomic, ClientCertificateRecord, ConfigStore, PUBLIC_FILE_MODE};

pub mod adopt;
pub mod builder;
pub mod extensions;
pub mod subject;


pub use adopt::adopt_client_certificate;
pub use builder::SigningInput;
pub use extensions::{augment_client_auth, ExtensionEntry};

/// Name of the canonical client certificate inside the storage directory
pub const CLIENT_CERT_FILE_NAME: &str = "client-cert.pem";

/// Validity of self-signed certificates when none is requested
pub const DEFAULT_VALIDITY_DAYS: u32 = 30;

pub const REPLACE_CERT_PROMPT: &str = "ATTENTION: A client certificate already exists. \
Replacing it requires you to register the new certificate with the KMIP server.\n\
Replace the client certificate [y/N]? ";

/// Public key algorithm of a client certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateAlgorithm {
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "RSA-PSS")]
    RsaPss,
    #[serde(rename = "ECC")]
    Ecc,
}

impl CertificateAlgorithm {
    /// Classify a public key by its algorithm identifier
    pub fn classify(spki: &SubjectPublicKeyInfoOwned) -> KmsResult<Self> {
        match spki.algorithm.oid {
            oid if oid == RSA_ENCRYPTION => Ok(CertificateAlgorithm::Rsa),
            oid if oid == ID_RSASSA_PSS => Ok(CertificateAlgorithm::RsaPss),
            oid if oid == ID_EC_PUBLIC_KEY => Ok(CertificateAlgorithm::Ecc),
            oid => Err(KmsError::invalid_request(
                "client-cert",
                &format!("unsupported public key algorithm {}", oid),
            )),
        }
    }

    /// Whether a certificate of this kind can belong to a key of `algorithm`
    pub fn fits(&self, algorithm: KeyAlgorithm) -> bool {
        matches!(
            (self, algorithm),
            (CertificateAlgorithm::Rsa | CertificateAlgorithm::RsaPss, KeyAlgorithm::Rsa)
                | (CertificateAlgorithm::Ecc, KeyAlgorithm::Ecc)
        )
    }
}

impl fmt::Display for CertificateAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateAlgorithm::Rsa => f.write_str("RSA"),
            CertificateAlgorithm::RsaPss => f.write_str("RSA-PSS"),
            CertificateAlgorithm::Ecc => f.write_str("ECC"),
        }
    }
}

/// What to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateMode {
    Csr { new_header: bool },
    SelfSigned { validity_days: u32 },
}

/// Inputs of one certificate or request generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub mode: CertificateMode,
    pub output: PathBuf,
    pub subject: Option<String>,
    pub extensions: Option<String>,
    pub renew_template: Option<PathBuf>,
    pub digest: Option<DigestAlgorithm>,
    pub rsa_pss: bool,
}

impl CertificateRequest {
    pub fn csr<P: AsRef<Path>>(output: P) -> Self {
        Self::new(CertificateMode::Csr { new_header: false }, output)
    }

    pub fn self_signed<P: AsRef<Path>>(output: P) -> Self {
        Self::new(
            CertificateMode::SelfSigned {
                validity_days: DEFAULT_VALIDITY_DAYS,
            },
            output,
        )
    }

    fn new<P: AsRef<Path>>(mode: CertificateMode, output: P) -> Self {
        Self {
            mode,
            output: output.as_ref().to_path_buf(),
            subject: None,
            extensions: None,
            renew_template: None,
            digest: None,
            rsa_pss: false,
        }
    }

    /// Parse and check all inputs for an identity key of `key`
    ///
    /// Reads the renewal template, if any. Nothing is signed or written.
    pub fn prepare(&self, key: &KeySpec, hostname: &str) -> KmsResult<SigningInput> {
        if let CertificateMode::SelfSigned { validity_days } = self.mode {
            builder::validity_from_now(validity_days)?;
        }

        let explicit_subject = self
            .subject
            .as_deref()
            .map(subject::parse_subject)
            .transpose()?;
        let explicit_extensions = match self.extensions.as_deref() {
            Some(value) => extensions::parse_extensions(value)?,
            None => Vec::new(),
        };
        let template = self
            .renew_template
            .as_deref()
            .map(load_certificate)
            .transpose()?;

        let (subject, mut extensions) = match (template, explicit_subject) {
            (Some(template), explicit) => {
                let tbs = &template.tbs_certificate;
                let subject = match explicit {
                    Some(entries) => subject::merge_subject(&tbs.subject, entries)?,
                    None => tbs.subject.clone(),
                };
                let inherited = tbs.extensions.as_deref().unwrap_or_default();
                (
                    subject,
                    extensions::merge_template_extensions(inherited, explicit_extensions),
                )
            }
            (None, Some(entries)) => (subject::build_name(entries)?, explicit_extensions),
            (None, None) => {
                return Err(KmsError::invalid_request(
                    "cert-subject",
                    "a subject is required unless a certificate is renewed",
                ))
            }
        };

        augment_client_auth(&mut extensions, hostname)?;

        let scheme = signature_scheme(key, self.digest, self.rsa_pss)?;

        Ok(SigningInput {
            subject,
            extensions,
            scheme,
        })
    }
}

/// Signature scheme for a key, an optional digest and the RSA-PSS flag
pub fn signature_scheme(key: &KeySpec, digest: Option<DigestAlgorithm>, rsa_pss: bool) -> KmsResult<SignatureScheme> {
    let digest = digest.unwrap_or_else(|| key.default_digest());

    match key {
        KeySpec::Rsa { .. } if rsa_pss => Ok(SignatureScheme::RsaPss(digest)),
        KeySpec::Rsa { .. } => Ok(SignatureScheme::RsaPkcs1v15(digest)),
        KeySpec::Ec { .. } if rsa_pss => Err(KmsError::invalid_request(
            "cert-rsa-pss",
            "RSA-PSS can only be used with an RSA identity key",
        )),
        KeySpec::Ec { .. } => Ok(SignatureScheme::Ecdsa(digest)),
    }
}

/// Read a PEM or DER certificate
pub fn load_certificate(path: &Path) -> KmsResult<Certificate> {
    let bytes = fs::read(path).map_err(|e| {
        KmsError::invalid_request(
            "certificate",
            &format!("failed to read {}: {}", path.display(), e),
        )
    })?;

    let parsed = if bytes.starts_with(b"-----BEGIN") {
        Certificate::from_pem(&bytes)
    } else {
        Certificate::from_der(&bytes)
    };

    parsed.map_err(|e| {
        KmsError::invalid_request(
            "certificate",
            &format!("failed to parse {}: {}", path.display(), e),
        )
    })
}

/// Store `certificate` as the client certificate of the plugin
pub(crate) fn install_client_certificate(
    store: &mut ConfigStore,
    certificate: &Certificate,
    algorithm: CertificateAlgorithm,
) -> KmsResult<()> {
    let pem = certificate.to_pem(LineEnding::LF)?;
    let path = store.storage_dir().join(CLIENT_CERT_FILE_NAME);
    write_atomic(&path, pem.as_bytes(), PUBLIC_FILE_MODE)?;

    store.config_mut().client_certificate = Some(ClientCertificateRecord { path, algorithm });
    store.save()
}

/// Generate a request or self-signed certificate for the identity key
///
/// Without an identity key, one of the default spec is generated first. A
/// self-signed certificate replaces the client certificate, which needs
/// confirmation if one exists.
pub fn generate_certificate(
    request: &CertificateRequest,
    hostname: &str,
    binding: &mut ProviderBinding,
    store: &mut ConfigStore,
    confirm: &mut dyn Confirm,
) -> KmsResult<()> {
    if !store.config().adapters_configured() {
        return Err(KmsError::incomplete("APQNs"));
    }

    let self_signed = matches!(request.mode, CertificateMode::SelfSigned { .. });
    if self_signed && store.config().client_cert_present() && !confirm.confirm(REPLACE_CERT_PROMPT) {
        return Err(KmsError::cancelled("self-signed certificate generation"));
    }

    if !store.config().identity_key_present() {
        log::debug!("No identity key exists, generating one of type {}", KeySpec::default_spec());
        generate_identity_key(&KeySpec::default_spec(), binding, store, confirm)?;
    }

    let (blob, key) = load_identity_key(store)?;
    let input = request.prepare(&key, hostname)?;
    let mut signer = binding.signer(&blob)?;

    match request.mode {
        CertificateMode::Csr { new_header } => {
            let csr = builder::build_csr(&mut signer, &input)?;
            let pem = builder::csr_to_pem(&csr, new_header)?;
            write_atomic(&request.output, pem.as_bytes(), PUBLIC_FILE_MODE)?;
            log::debug!("Wrote certificate signing request to {}", request.output.display());
        }
        CertificateMode::SelfSigned { validity_days } => {
            let certificate = builder::build_self_signed(&mut signer, &input, validity_days)?;
            let algorithm = CertificateAlgorithm::classify(&certificate.tbs_certificate.subject_public_key_info)?;
            let pem = certificate.to_pem(LineEnding::LF)?;

            write_atomic(&request.output, pem.as_bytes(), PUBLIC_FILE_MODE)?;
            install_client_certificate(store, &certificate, algorithm)?;
            log::debug!(
                "Wrote self-signed certificate to {}, valid for {} days",
                request.output.display(),
                validity_days
            );
        }
    }

    Ok(())
}

/// Details of the installed client certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateSummary {
    pub path: PathBuf,
    pub algorithm: CertificateAlgorithm,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: chrono::DateTime<chrono::Utc>,
    pub not_after: chrono::DateTime<chrono::Utc>,
}

impl CertificateSummary {
    pub fn load(record: &ClientCertificateRecord) -> KmsResult<Self> {
        let certificate = load_certificate(&record.path)?;
        let tbs = &certificate.tbs_certificate;

        let to_chrono = |time: &x509_cert::time::Time| {
            chrono::DateTime::<chrono::Utc>::from(time.to_system_time())
        };

        Ok(Self {
            path: record.path.clone(),
            algorithm: record.algorithm,
            subject: tbs.subject.to_string(),
            issuer: tbs.issuer.to_string(),
            serial: hex::encode(tbs.serial_number.as_bytes()),
            not_before: to_chrono(&tbs.validity.not_before),
            not_after: to_chrono(&tbs.validity.not_after),
        })
    }
}

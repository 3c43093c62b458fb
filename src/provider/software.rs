//! Software provider keeping identity keys as PKCS #8 documents.
//!
//! Intended for hosts without crypto adapters and for testing. The blob
//! is the unencrypted PKCS #8 DER of the private key.

use const_oid::db::rfc5912::{
    ID_EC_PUBLIC_KEY, ID_RSASSA_PSS, RSA_ENCRYPTION, SECP_256_R_1, SECP_384_R_1, SECP_521_R_1,
};
use const_oid::AssociatedOid;
use der::Decode;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, PrivateKeyInfo};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::digest::FixedOutputReset;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

use super::{CryptoProvider, DigestAlgorithm, KeyBlob, ProviderFactory, SignatureScheme};
use crate::adapter::{AdapterFamily, Endpoint};
use crate::error::{error_codes, KmsError, KmsResult};
use crate::identity::{EcCurve, KeySpec};

/// Opens [`SoftwareProvider`]s for any endpoint
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareProviderFactory;

impl SoftwareProviderFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ProviderFactory for SoftwareProviderFactory {
    fn open(&self, family: AdapterFamily, endpoint: Endpoint) -> KmsResult<Box<dyn CryptoProvider>> {
        Ok(Box::new(SoftwareProvider { family, endpoint }))
    }
}

#[derive(Debug)]
pub struct SoftwareProvider {
    family: AdapterFamily,
    endpoint: Endpoint,
}

enum SoftwareKey {
    Rsa(RsaPrivateKey),
    P256(p256::SecretKey),
    P384(p384::SecretKey),
    P521(p521::SecretKey),
}

fn invalid_blob(cause: &str) -> KmsError {
    KmsError::provider_error("decode key blob", cause, error_codes::PROVIDER_INVALID_BLOB)
}

fn signing_failed(cause: impl std::fmt::Display) -> KmsError {
    KmsError::provider_error("sign", &cause.to_string(), error_codes::PROVIDER_SIGNING_FAILED)
}

impl SoftwareKey {
    fn decode(blob: &KeyBlob) -> KmsResult<Self> {
        let info = PrivateKeyInfo::try_from(blob.as_bytes()).map_err(|e| invalid_blob(&e.to_string()))?;

        if info.algorithm.oid == RSA_ENCRYPTION {
            return RsaPrivateKey::from_pkcs8_der(blob.as_bytes())
                .map(SoftwareKey::Rsa)
                .map_err(|e| invalid_blob(&e.to_string()));
        }

        if info.algorithm.oid != ID_EC_PUBLIC_KEY {
            return Err(invalid_blob(&format!("unsupported key algorithm {}", info.algorithm.oid)));
        }

        let curve = info
            .algorithm
            .parameters_oid()
            .map_err(|e| invalid_blob(&e.to_string()))?;
        let key = match curve {
            c if c == SECP_256_R_1 => p256::SecretKey::from_pkcs8_der(blob.as_bytes()).map(SoftwareKey::P256),
            c if c == SECP_384_R_1 => p384::SecretKey::from_pkcs8_der(blob.as_bytes()).map(SoftwareKey::P384),
            c if c == SECP_521_R_1 => p521::SecretKey::from_pkcs8_der(blob.as_bytes()).map(SoftwareKey::P521),
            other => return Err(invalid_blob(&format!("unsupported curve {}", other))),
        };

        key.map_err(|e| invalid_blob(&e.to_string()))
    }

    fn public_key_der(&self) -> KmsResult<Vec<u8>> {
        let document = match self {
            SoftwareKey::Rsa(key) => key.to_public_key().to_public_key_der(),
            SoftwareKey::P256(key) => key.public_key().to_public_key_der(),
            SoftwareKey::P384(key) => key.public_key().to_public_key_der(),
            SoftwareKey::P521(key) => key.public_key().to_public_key_der(),
        };

        document.map(|d| d.as_bytes().to_vec()).map_err(|e| {
            KmsError::provider_error("public key", &e.to_string(), error_codes::PROVIDER_PUBLIC_KEY_FAILED)
        })
    }
}

fn rsa_sign<D>(key: &RsaPrivateKey, pss: bool, message: &[u8]) -> KmsResult<Vec<u8>>
where
    D: Digest + AssociatedOid + FixedOutputReset,
{
    if pss {
        let signing_key = rsa::pss::BlindedSigningKey::<D>::new(key.clone());
        let signature = signing_key
            .try_sign_with_rng(&mut OsRng, message)
            .map_err(signing_failed)?;
        Ok(signature.to_vec())
    } else {
        let signing_key = rsa::pkcs1v15::SigningKey::<D>::new(key.clone());
        let signature = signing_key.try_sign(message).map_err(signing_failed)?;
        Ok(signature.to_vec())
    }
}

/// Hash for ECDSA, left-padded to the field length when the digest is shorter
fn ecdsa_prehash(digest: DigestAlgorithm, message: &[u8], field_len: usize) -> Vec<u8> {
    let hash = digest.digest(message);
    if hash.len() >= field_len {
        return hash;
    }
    let mut padded = vec![0u8; field_len - hash.len()];
    padded.extend_from_slice(&hash);
    padded
}

macro_rules! ecdsa_sign {
    ($curve:ident, $key:expr, $prehash:expr) => {{
        let signing_key = $curve::ecdsa::SigningKey::from_bytes(&$key.to_bytes()).map_err(signing_failed)?;
        let signature: $curve::ecdsa::Signature = signing_key.sign_prehash($prehash).map_err(signing_failed)?;
        signature.to_der().as_bytes().to_vec()
    }};
}

impl CryptoProvider for SoftwareProvider {
    fn family(&self) -> AdapterFamily {
        self.family
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn name(&self) -> &'static str {
        "software"
    }

    fn generate_key(&mut self, spec: &KeySpec) -> KmsResult<KeyBlob> {
        let generation_failed = |cause: String| {
            KmsError::provider_error("generate key", &cause, error_codes::PROVIDER_KEY_GENERATION_FAILED)
        };

        let document = match spec {
            KeySpec::Rsa { bits } => RsaPrivateKey::new(&mut OsRng, *bits as usize)
                .map_err(|e| generation_failed(e.to_string()))?
                .to_pkcs8_der(),
            KeySpec::Ec { curve: EcCurve::P256 } => p256::SecretKey::random(&mut OsRng).to_pkcs8_der(),
            KeySpec::Ec { curve: EcCurve::P384 } => p384::SecretKey::random(&mut OsRng).to_pkcs8_der(),
            KeySpec::Ec { curve: EcCurve::P521 } => p521::SecretKey::random(&mut OsRng).to_pkcs8_der(),
        }
        .map_err(|e| generation_failed(e.to_string()))?;

        log::debug!("Generated {} key in software for APQN {}", spec, self.endpoint);
        Ok(KeyBlob::new(document.as_bytes().to_vec()))
    }

    fn public_key(&mut self, blob: &KeyBlob, rsa_pss: bool) -> KmsResult<SubjectPublicKeyInfoOwned> {
        let key = SoftwareKey::decode(blob)?;
        let mut spki = SubjectPublicKeyInfoOwned::from_der(&key.public_key_der()?)?;

        if rsa_pss && matches!(key, SoftwareKey::Rsa(_)) {
            spki.algorithm = AlgorithmIdentifierOwned {
                oid: ID_RSASSA_PSS,
                parameters: None,
            };
        }

        Ok(spki)
    }

    fn sign(&mut self, blob: &KeyBlob, scheme: &SignatureScheme, message: &[u8]) -> KmsResult<Vec<u8>> {
        let key = SoftwareKey::decode(blob)?;

        let signature = match (&key, scheme) {
            (SoftwareKey::Rsa(rsa_key), SignatureScheme::RsaPkcs1v15(d) | SignatureScheme::RsaPss(d)) => {
                let pss = scheme.is_pss();
                match d {
                    DigestAlgorithm::Sha224 => rsa_sign::<Sha224>(rsa_key, pss, message)?,
                    DigestAlgorithm::Sha256 => rsa_sign::<Sha256>(rsa_key, pss, message)?,
                    DigestAlgorithm::Sha384 => rsa_sign::<Sha384>(rsa_key, pss, message)?,
                    DigestAlgorithm::Sha512 => rsa_sign::<Sha512>(rsa_key, pss, message)?,
                }
            }
            (SoftwareKey::P256(ec_key), SignatureScheme::Ecdsa(d)) => {
                let prehash = ecdsa_prehash(*d, message, 32);
                ecdsa_sign!(p256, ec_key, &prehash)
            }
            (SoftwareKey::P384(ec_key), SignatureScheme::Ecdsa(d)) => {
                let prehash = ecdsa_prehash(*d, message, 48);
                ecdsa_sign!(p384, ec_key, &prehash)
            }
            (SoftwareKey::P521(ec_key), SignatureScheme::Ecdsa(d)) => {
                let prehash = ecdsa_prehash(*d, message, 66);
                ecdsa_sign!(p521, ec_key, &prehash)
            }
            _ => {
                return Err(signing_failed(format!(
                    "signature scheme {:?} does not fit the key type",
                    scheme
                )))
            }
        };

        Ok(signature)
    }

    fn destroy_key(&mut self, _blob: &KeyBlob) -> KmsResult<()> {
        Ok(())
    }

    fn close(&mut self) -> KmsResult<()> {
        Ok(())
    }
}

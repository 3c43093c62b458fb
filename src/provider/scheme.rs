//! Digest and signature scheme selection for identity key signatures.

use std::fmt;
use std::str::FromStr;

use const_oid::db::rfc5912::{
    ECDSA_WITH_SHA_224, ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ECDSA_WITH_SHA_512,
    ID_SHA_224, ID_SHA_256, ID_SHA_384, ID_SHA_512, SHA_224_WITH_RSA_ENCRYPTION,
    SHA_256_WITH_RSA_ENCRYPTION, SHA_384_WITH_RSA_ENCRYPTION, SHA_512_WITH_RSA_ENCRYPTION,
};
use der::asn1::{AnyRef, OctetString};
use der::{Encode, Sequence};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use spki::{AlgorithmIdentifierOwned, ObjectIdentifier};

use crate::error::{error_codes, KmsError, KmsResult};

/// Message digests usable for certificate signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha224 => "sha224",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha224 => 28,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha224 => ID_SHA_224,
            DigestAlgorithm::Sha256 => ID_SHA_256,
            DigestAlgorithm::Sha384 => ID_SHA_384,
            DigestAlgorithm::Sha512 => ID_SHA_512,
        }
    }

    pub fn digest(&self, message: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha224 => Sha224::digest(message).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(message).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(message).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(message).to_vec(),
        }
    }

    /// DER `DigestInfo` of `message`, as signed with PKCS #1 v1.5
    pub fn digest_info(&self, message: &[u8]) -> KmsResult<Vec<u8>> {
        let info = DigestInfo {
            algorithm: AlgorithmIdentifierOwned {
                oid: self.oid(),
                parameters: Some(AnyRef::NULL.into()),
            },
            digest: OctetString::new(self.digest(message))?,
        };
        Ok(info.to_der()?)
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = KmsError;

    /// Accepts `sha256`, `SHA256` and `SHA-256` style names
    fn from_str(s: &str) -> KmsResult<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "");
        match normalized.as_str() {
            "sha224" => Ok(DigestAlgorithm::Sha224),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(KmsError::invalid_request_with_code(
                "cert-digest",
                &format!("digest '{}' not supported", s),
                error_codes::UNSUPPORTED_DIGEST,
            )),
        }
    }
}

#[derive(Sequence)]
struct DigestInfo {
    algorithm: AlgorithmIdentifierOwned,
    digest: OctetString,
}

/// How the identity key signs a certificate or request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    RsaPkcs1v15(DigestAlgorithm),
    /// RSASSA-PSS with MGF1 over the same digest and a salt of digest length
    RsaPss(DigestAlgorithm),
    Ecdsa(DigestAlgorithm),
}

impl SignatureScheme {
    pub fn digest(&self) -> DigestAlgorithm {
        match self {
            SignatureScheme::RsaPkcs1v15(d)
            | SignatureScheme::RsaPss(d)
            | SignatureScheme::Ecdsa(d) => *d,
        }
    }

    pub fn is_pss(&self) -> bool {
        matches!(self, SignatureScheme::RsaPss(_))
    }

    /// Signature algorithm identifier as placed in certificates and requests
    pub fn algorithm_identifier(&self) -> KmsResult<AlgorithmIdentifierOwned> {
        let null = || Some(AnyRef::NULL.into());

        let identifier = match self {
            SignatureScheme::RsaPkcs1v15(d) => AlgorithmIdentifierOwned {
                oid: match d {
                    DigestAlgorithm::Sha224 => SHA_224_WITH_RSA_ENCRYPTION,
                    DigestAlgorithm::Sha256 => SHA_256_WITH_RSA_ENCRYPTION,
                    DigestAlgorithm::Sha384 => SHA_384_WITH_RSA_ENCRYPTION,
                    DigestAlgorithm::Sha512 => SHA_512_WITH_RSA_ENCRYPTION,
                },
                parameters: null(),
            },
            SignatureScheme::RsaPss(d) => {
                let result = match d {
                    DigestAlgorithm::Sha224 => rsa::pss::get_default_pss_signature_algo_id::<Sha224>(),
                    DigestAlgorithm::Sha256 => rsa::pss::get_default_pss_signature_algo_id::<Sha256>(),
                    DigestAlgorithm::Sha384 => rsa::pss::get_default_pss_signature_algo_id::<Sha384>(),
                    DigestAlgorithm::Sha512 => rsa::pss::get_default_pss_signature_algo_id::<Sha512>(),
                };
                result.map_err(|e| KmsError::SerializationError(e.to_string()))?
            }
            SignatureScheme::Ecdsa(d) => AlgorithmIdentifierOwned {
                oid: match d {
                    DigestAlgorithm::Sha224 => ECDSA_WITH_SHA_224,
                    DigestAlgorithm::Sha256 => ECDSA_WITH_SHA_256,
                    DigestAlgorithm::Sha384 => ECDSA_WITH_SHA_384,
                    DigestAlgorithm::Sha512 => ECDSA_WITH_SHA_512,
                },
                parameters: None,
            },
        };

        Ok(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_names() {
        assert_eq!("SHA-384".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha384);
        assert_eq!("sha512".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha512);

        let err = "md5".parse::<DigestAlgorithm>().unwrap_err();
        assert_eq!(err.error_code(), error_codes::UNSUPPORTED_DIGEST);
    }

    #[test]
    fn test_digest_lengths() {
        for digest in [
            DigestAlgorithm::Sha224,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ] {
            assert_eq!(digest.digest(b"abc").len(), digest.output_len());
        }
    }

    #[test]
    fn test_sha256_digest_info_prefix() {
        let info = DigestAlgorithm::Sha256.digest_info(b"abc").unwrap();
        let prefix = hex::decode("3031300d060960864801650304020105000420").unwrap();
        assert_eq!(&info[..prefix.len()], prefix.as_slice());
        assert_eq!(info.len(), prefix.len() + 32);
    }

    #[test]
    fn test_algorithm_identifiers() {
        let ecdsa = SignatureScheme::Ecdsa(DigestAlgorithm::Sha512)
            .algorithm_identifier()
            .unwrap();
        assert_eq!(ecdsa.oid, ECDSA_WITH_SHA_512);
        assert!(ecdsa.parameters.is_none());

        let pss = SignatureScheme::RsaPss(DigestAlgorithm::Sha256)
            .algorithm_identifier()
            .unwrap();
        assert_eq!(pss.oid, const_oid::db::rfc5912::ID_RSASSA_PSS);
        assert!(pss.parameters.is_some());
    }
}

/*!
 * Crypto Providers
 *
 * A provider performs identity key operations on one adapter endpoint.
 * Key material never leaves the provider in the clear: the plugin only
 * ever holds an opaque key blob that the provider can use again later.
 *
 * Two backends are available:
 * - `pkcs11`: keys live in a PKCS #11 token (the HSM backend)
 * - `software`: keys are PKCS #8 documents, for hosts without adapters
 */

use std::fmt;

use spki::SubjectPublicKeyInfoOwned;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::adapter::{AdapterFamily, Endpoint};
use crate::error::KmsResult;
use crate::identity::KeySpec;

pub mod binding;
pub mod pkcs11;
pub mod scheme;
pub mod software;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use binding::{IdentitySigner, ProviderBinding, SelectionStrategy};
pub use pkcs11::{Pkcs11ProviderFactory, Pkcs11Settings};
pub use scheme::{DigestAlgorithm, SignatureScheme};
pub use software::SoftwareProviderFactory;

/// Opaque, provider-specific representation of a secure key
///
/// The content is wiped when the blob is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyBlob(Vec<u8>);

impl KeyBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyBlob([REDACTED; {} bytes])", self.0.len())
    }
}

/// Identity key operations on one bound endpoint
pub trait CryptoProvider {
    fn family(&self) -> AdapterFamily;

    fn endpoint(&self) -> Endpoint;

    /// Backend name used in log messages and errors
    fn name(&self) -> &'static str;

    /// Generate a new key pair and return its secure blob
    fn generate_key(&mut self, spec: &KeySpec) -> KmsResult<KeyBlob>;

    /// Public key of a blob
    ///
    /// With `rsa_pss` set, an RSA key is reported with the RSASSA-PSS
    /// algorithm identifier instead of rsaEncryption.
    fn public_key(&mut self, blob: &KeyBlob, rsa_pss: bool) -> KmsResult<SubjectPublicKeyInfoOwned>;

    /// Sign `message` with the key in `blob`
    ///
    /// The provider hashes the message with the scheme's digest. ECDSA
    /// signatures are returned DER encoded.
    fn sign(&mut self, blob: &KeyBlob, scheme: &SignatureScheme, message: &[u8])
        -> KmsResult<Vec<u8>>;

    /// Delete the backend objects behind `blob`
    ///
    /// Blobs that carry the whole key leave nothing behind in the backend.
    fn destroy_key(&mut self, blob: &KeyBlob) -> KmsResult<()>;

    /// Release the backend session
    fn close(&mut self) -> KmsResult<()>;
}

/// Opens providers for endpoints
pub trait ProviderFactory {
    fn open(&self, family: AdapterFamily, endpoint: Endpoint) -> KmsResult<Box<dyn CryptoProvider>>;
}

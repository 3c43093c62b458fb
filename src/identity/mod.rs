/*!
 * Identity Key
 *
 * The identity key authenticates the plugin to the KMIP server. It is
 * generated by the bound provider and persisted as an opaque blob file in
 * the storage directory; the configuration records where the blob is and
 * which algorithm it holds.
 *
 * Key specifications use the syntax `RSA:<bits>` or `EC:<curve>`
 * (`ECC:` is accepted as well).
 */

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use spki::ObjectIdentifier;

use crate::confirm::Confirm;
use crate::error::{KmsError, KmsResult};
use crate::provider::{DigestAlgorithm, KeyBlob, ProviderBinding};
use crate::store::{
    remove_if_exists, write_atomic, ConfigStore, IdentityKeyRecord, KeyMetadata, PRIVATE_FILE_MODE,
};


/// Key specification used when none is given
pub const DEFAULT_KEY_SPEC: &str = "ECC:secp521r1";

/// RSA modulus sizes accepted for identity keys
pub const RSA_KEY_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

pub const REGENERATE_PROMPT: &str = "ATTENTION: An identity key already exists. \
Re-generating the identity key invalidates the existing client certificate, \
and you must re-register the new certificate with the KMIP server.\n\
Re-generate the identity key [y/N]? ";

/// Identity key algorithm families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "ECC")]
    Ecc,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa => f.write_str("RSA"),
            KeyAlgorithm::Ecc => f.write_str("ECC"),
        }
    }
}

/// Supported elliptic curves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl EcCurve {
    /// Canonical curve name, as stored in the key metadata
    pub fn name(&self) -> &'static str {
        match self {
            EcCurve::P256 => "secp256r1",
            EcCurve::P384 => "secp384r1",
            EcCurve::P521 => "secp521r1",
        }
    }

    pub fn oid(&self) -> ObjectIdentifier {
        use const_oid::db::rfc5912::{SECP_256_R_1, SECP_384_R_1, SECP_521_R_1};
        match self {
            EcCurve::P256 => SECP_256_R_1,
            EcCurve::P384 => SECP_384_R_1,
            EcCurve::P521 => SECP_521_R_1,
        }
    }

    /// Size of a field element in bytes
    pub fn field_len(&self) -> usize {
        match self {
            EcCurve::P256 => 32,
            EcCurve::P384 => 48,
            EcCurve::P521 => 66,
        }
    }

    /// Digest matching the curve strength
    pub fn default_digest(&self) -> DigestAlgorithm {
        match self {
            EcCurve::P256 => DigestAlgorithm::Sha256,
            EcCurve::P384 => DigestAlgorithm::Sha384,
            EcCurve::P521 => DigestAlgorithm::Sha512,
        }
    }
}

impl FromStr for EcCurve {
    type Err = KmsError;

    fn from_str(s: &str) -> KmsResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "secp256r1" | "prime256v1" | "p-256" | "p256" => Ok(EcCurve::P256),
            "secp384r1" | "p-384" | "p384" => Ok(EcCurve::P384),
            "secp521r1" | "p-521" | "p521" => Ok(EcCurve::P521),
            _ => Err(KmsError::invalid_key_spec(s, "unsupported curve")),
        }
    }
}

/// Algorithm and size of an identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpec {
    Rsa { bits: u32 },
    Ec { curve: EcCurve },
}

impl KeySpec {
    /// Parse `RSA:<bits>`, `EC:<curve>` or `ECC:<curve>`
    pub fn parse(spec: &str) -> KmsResult<Self> {
        let (algorithm, params) = spec
            .split_once(':')
            .ok_or_else(|| KmsError::invalid_key_spec(spec, "expected ALGORITHM:PARAMS"))?;
        let params = params.trim();

        if algorithm.trim().eq_ignore_ascii_case("RSA") {
            let canonical = !params.is_empty()
                && !params.starts_with('0')
                && params.bytes().all(|b| b.is_ascii_digit());
            let bits = params
                .parse::<u32>()
                .ok()
                .filter(|_| canonical)
                .ok_or_else(|| KmsError::invalid_key_spec(spec, "the RSA key size must be a number"))?;
            if !RSA_KEY_SIZES.contains(&bits) {
                return Err(KmsError::invalid_key_spec(
                    spec,
                    "the RSA key size must be one of 512, 1024, 2048, 4096",
                ));
            }
            Ok(KeySpec::Rsa { bits })
        } else if algorithm.trim().eq_ignore_ascii_case("EC") || algorithm.trim().eq_ignore_ascii_case("ECC") {
            let curve = params
                .parse::<EcCurve>()
                .map_err(|_| KmsError::invalid_key_spec(spec, "unsupported curve"))?;
            Ok(KeySpec::Ec { curve })
        } else {
            Err(KmsError::invalid_key_spec(spec, "the algorithm must be RSA or EC"))
        }
    }

    pub fn default_spec() -> Self {
        KeySpec::Ec { curve: EcCurve::P521 }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            KeySpec::Rsa { .. } => KeyAlgorithm::Rsa,
            KeySpec::Ec { .. } => KeyAlgorithm::Ecc,
        }
    }

    /// Digest used for certificates when none is requested
    pub fn default_digest(&self) -> DigestAlgorithm {
        match self {
            KeySpec::Rsa { .. } => DigestAlgorithm::Sha256,
            KeySpec::Ec { curve } => curve.default_digest(),
        }
    }

    pub fn metadata(&self) -> KeyMetadata {
        let params = match self {
            KeySpec::Rsa { bits } => bits.to_string(),
            KeySpec::Ec { curve } => curve.name().to_string(),
        };
        KeyMetadata {
            algorithm: self.algorithm(),
            params,
        }
    }

    pub fn from_metadata(metadata: &KeyMetadata) -> KmsResult<Self> {
        match metadata.algorithm {
            KeyAlgorithm::Rsa => Self::parse(&format!("RSA:{}", metadata.params)),
            KeyAlgorithm::Ecc => Self::parse(&format!("ECC:{}", metadata.params)),
        }
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Rsa { bits } => write!(f, "RSA:{}", bits),
            KeySpec::Ec { curve } => write!(f, "ECC:{}", curve.name()),
        }
    }
}

impl FromStr for KeySpec {
    type Err = KmsError;

    fn from_str(s: &str) -> KmsResult<Self> {
        Self::parse(s)
    }
}

/// File name for a new identity key blob
fn blob_file_name() -> String {
    format!("identity-key-{}.bin", uuid::Uuid::new_v4().simple())
}

/// Generate a new identity key and make it the current one
///
/// An existing identity key is only replaced after `confirm` agrees. The
/// new key becomes current only once its blob is on disk; on any failure
/// the previous key stays in place. A successful regeneration drops the
/// client certificate and any pending re-encipherment.
pub fn generate_identity_key(
    spec: &KeySpec,
    binding: &mut ProviderBinding,
    store: &mut ConfigStore,
    confirm: &mut dyn Confirm,
) -> KmsResult<()> {
    if store.config().identity_key_present() && !confirm.confirm(REGENERATE_PROMPT) {
        return Err(KmsError::cancelled("identity key generation"));
    }

    store.config_mut().pending_identity_key = Some(spec.metadata());
    store.save()?;

    let blob = match binding.provider().and_then(|p| p.generate_key(spec)) {
        Ok(blob) => blob,
        Err(e) => {
            store.config_mut().pending_identity_key = None;
            if let Err(save_err) = store.save() {
                log::warn!("Failed to clear the pending identity key: {}", save_err);
            }
            return Err(e);
        }
    };

    let blob_path = store.storage_dir().join(blob_file_name());
    if let Err(e) = write_atomic(&blob_path, blob.as_bytes(), PRIVATE_FILE_MODE) {
        discard_key(binding, &blob);
        store.config_mut().pending_identity_key = None;
        if let Err(save_err) = store.save() {
            log::warn!("Failed to clear the pending identity key: {}", save_err);
        }
        return Err(e);
    }

    let previous = store.config().clone();
    {
        let config = store.config_mut();
        config.identity_key = Some(IdentityKeyRecord {
            path: blob_path.clone(),
            metadata: spec.metadata(),
        });
        config.pending_identity_key = None;
        config.identity_key_reenc = None;
        config.client_certificate = None;
    }

    if let Err(e) = store.save() {
        *store.config_mut() = previous;
        store.config_mut().pending_identity_key = None;
        if let Err(remove_err) = remove_if_exists(&blob_path) {
            log::warn!("Failed to remove {}: {}", blob_path.display(), remove_err);
        }
        discard_key(binding, &blob);
        return Err(e);
    }

    if let Some(record) = previous.identity_key.as_ref().filter(|k| k.path != blob_path) {
        match fs::read(&record.path) {
            Ok(bytes) => discard_key(binding, &KeyBlob::new(bytes)),
            Err(e) => log::warn!("Failed to read {}: {}", record.path.display(), e),
        }
    }

    // the new key is committed, stale material can go
    let stale: Vec<PathBuf> = [
        previous.identity_key.map(|k| k.path),
        previous.identity_key_reenc,
        previous.client_certificate.map(|c| c.path),
    ]
    .into_iter()
    .flatten()
    .filter(|path| *path != blob_path)
    .collect();

    for path in stale {
        if let Err(e) = remove_if_exists(&path) {
            log::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }

    log::debug!("Generated identity key {} ({})", spec, blob_path.display());
    Ok(())
}

/// Delete the backend objects of a key that is no longer referenced
fn discard_key(binding: &mut ProviderBinding, blob: &KeyBlob) {
    if let Err(e) = binding.provider().and_then(|p| p.destroy_key(blob)) {
        log::warn!("Failed to destroy identity key objects: {}", e);
    }
}

/// Read the current identity key blob and its specification
pub fn load_identity_key(store: &ConfigStore) -> KmsResult<(KeyBlob, KeySpec)> {
    let record = store
        .config()
        .identity_key
        .as_ref()
        .ok_or_else(|| KmsError::incomplete("identity key"))?;

    let spec = KeySpec::from_metadata(&record.metadata)?;
    let bytes = fs::read(&record.path).map_err(|e| {
        KmsError::config_error(
            "load identity key",
            &format!("failed to read {}: {}", record.path.display(), e),
            crate::error::error_codes::CONFIG_LOAD_FAILED,
        )
    })?;

    Ok((KeyBlob::new(bytes), spec))
}

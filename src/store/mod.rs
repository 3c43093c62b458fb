/*!
 * Configuration Store
 *
 * Typed, durable configuration of one plugin instance. The store is the
 * single source of truth for whether the configuration is complete.
 *
 * Files are written atomically: content goes to a temporary file in the
 * storage directory which is then renamed over the target.
 *
 * Migration policy: keys missing from the file take their defaults, keys
 * this version does not know are kept and written back unchanged, and a
 * file written by a newer format version is refused. Files without a
 * version are treated as version 0 and written back as the current version.
 */

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::adapter::{AdapterFamily, Endpoint};
use crate::certificate::CertificateAlgorithm;
use crate::error::{error_codes, KmsError, KmsResult};
use crate::identity::KeyAlgorithm;


/// Name of the configuration file inside the storage directory
pub const CONFIG_FILE_NAME: &str = "kmip-plugin.json";

/// Current configuration format version
pub const CONFIG_VERSION: u32 = 1;

/// File mode for secret material and the configuration
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// File mode for public material such as certificates
pub const PUBLIC_FILE_MODE: u32 = 0o644;

/// Algorithm and parameters describing an identity key blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub algorithm: KeyAlgorithm,
    /// Modulus bits for RSA, curve name for EC
    pub params: String,
}

/// The persisted identity key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyRecord {
    pub path: PathBuf,
    #[serde(flatten)]
    pub metadata: KeyMetadata,
}

/// The persisted client certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCertificateRecord {
    pub path: PathBuf,
    pub algorithm: CertificateAlgorithm,
}

/// Plugin configuration as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub version: u32,
    pub adapter_family: Option<AdapterFamily>,
    pub adapter_endpoints: Vec<Endpoint>,
    pub identity_key: Option<IdentityKeyRecord>,
    /// Metadata of an identity key generation that has not completed yet
    pub pending_identity_key: Option<KeyMetadata>,
    /// Marker file of a pending re-encipherment of the identity key
    pub identity_key_reenc: Option<PathBuf>,
    pub client_certificate: Option<ClientCertificateRecord>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            version: 0,
            adapter_family: None,
            adapter_endpoints: Vec::new(),
            identity_key: None,
            pending_identity_key: None,
            identity_key_reenc: None,
            client_certificate: None,
            extra: BTreeMap::new(),
        }
    }
}

impl PluginConfig {
    pub fn adapters_configured(&self) -> bool {
        self.adapter_family.is_some() && !self.adapter_endpoints.is_empty()
    }

    pub fn identity_key_present(&self) -> bool {
        self.identity_key.is_some()
    }

    pub fn client_cert_present(&self) -> bool {
        self.client_certificate.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.adapters_configured() && self.identity_key_present() && self.client_cert_present()
    }

    /// Names of the settings still missing for a complete configuration
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.adapters_configured() {
            missing.push("APQNs");
        }
        if !self.identity_key_present() {
            missing.push("identity key");
        }
        if !self.client_cert_present() {
            missing.push("client certificate");
        }
        missing
    }
}

/// Loads and saves the [`PluginConfig`] of one storage directory
#[derive(Debug)]
pub struct ConfigStore {
    storage_dir: PathBuf,
    config: PluginConfig,
}

impl ConfigStore {
    /// Open the store in `storage_dir`, loading the configuration if present
    pub fn open<P: AsRef<Path>>(storage_dir: P) -> KmsResult<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        if !storage_dir.is_dir() {
            return Err(KmsError::config_error(
                "open",
                &format!("storage directory {} does not exist", storage_dir.display()),
                error_codes::CONFIG_LOAD_FAILED,
            ));
        }

        let mut store = Self {
            storage_dir,
            config: PluginConfig::default(),
        };
        store.load()?;
        Ok(store)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join(CONFIG_FILE_NAME)
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut PluginConfig {
        &mut self.config
    }

    /// Re-read the configuration file, replacing the in-memory state
    pub fn load(&mut self) -> KmsResult<()> {
        let path = self.config_path();
        if !path.exists() {
            self.config = PluginConfig::default();
            return Ok(());
        }

        let contents = fs::read_to_string(&path).map_err(|e| {
            KmsError::config_error(
                "load",
                &format!("failed to read {}: {}", path.display(), e),
                error_codes::CONFIG_LOAD_FAILED,
            )
        })?;

        let config: PluginConfig = serde_json::from_str(&contents).map_err(|e| {
            KmsError::config_error(
                "load",
                &format!("failed to parse {}: {}", path.display(), e),
                error_codes::CONFIG_LOAD_FAILED,
            )
        })?;

        if config.version > CONFIG_VERSION {
            return Err(KmsError::config_error(
                "load",
                &format!(
                    "configuration version {} is newer than the supported version {}",
                    config.version, CONFIG_VERSION
                ),
                error_codes::CONFIG_VERSION_UNSUPPORTED,
            ));
        }

        if let Some(pending) = &config.pending_identity_key {
            log::warn!(
                "An identity key generation ({} {}) did not complete; the previous identity key is kept",
                pending.algorithm,
                pending.params
            );
        }

        self.config = config;
        Ok(())
    }

    /// Write the configuration to disk
    pub fn save(&mut self) -> KmsResult<()> {
        self.config.version = CONFIG_VERSION;

        let serialized = serde_json::to_string_pretty(&self.config)?;
        write_atomic(&self.config_path(), serialized.as_bytes(), PRIVATE_FILE_MODE).map_err(
            |e| {
                KmsError::config_error(
                    "save",
                    &e.to_string(),
                    error_codes::CONFIG_SAVE_FAILED,
                )
            },
        )
    }

    /// Delete the configuration file and reset the in-memory state
    pub fn remove(&mut self) -> KmsResult<()> {
        remove_if_exists(&self.config_path())?;
        self.config = PluginConfig::default();
        Ok(())
    }
}

/// Atomically replace `path` with `contents`
///
/// The file is created with `mode` before any content is written.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> KmsResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(dir)?;
    set_mode(temp.path(), mode)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| KmsError::IoError(e.error.to_string()))?;

    Ok(())
}

/// Remove a file, treating a missing file as success
pub fn remove_if_exists(path: &Path) -> KmsResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> KmsResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> KmsResult<()> {
    Ok(())
}

/*!
 * KMIP Plugin Lifecycle
 *
 * Host-facing surface of the plugin: initialization and teardown, the
 * re-entrant `configure` state machine, capability queries and the reserved
 * key operations.
 *
 * A `configure` call first validates all of its input against the persisted
 * state, then executes its steps in a fixed order: adapters, identity key,
 * certificate generation, certificate adoption. Every completed step is
 * persisted immediately; a failing step ends the call without undoing the
 * steps before it.
 */

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::adapter::{
    cross_check_master_keys, validate_endpoints, AdapterDirectory, AdapterFamily, Endpoint,
    SysfsAdapterDirectory, KEY_TYPE_CCA_AESCIPHER, KEY_TYPE_CCA_AESDATA, KEY_TYPE_EP11_AES,
};
use crate::certificate::{
    adopt_client_certificate, generate_certificate, load_certificate, CertificateMode, CertificateSummary,
};
use crate::confirm::{Confirm, Confirmation};
use crate::error::{error_codes, ErrorReport, KmsError, KmsResult};
use crate::identity::{generate_identity_key, load_identity_key, KeySpec};
use crate::provider::{Pkcs11ProviderFactory, Pkcs11Settings, ProviderBinding, ProviderFactory};
use crate::store::{remove_if_exists, ConfigStore, KeyMetadata};

pub mod options;


pub use options::{ConfigureOption, ConfigurePlan};

/// Outcome of a successful `configure` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureStatus {
    Complete,
    /// The input was accepted, but more configuration is required
    ContinueConfiguring,
}

/// How keys are re-enciphered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReencipherMode {
    Auto,
    InPlace,
    Staged,
    StagedComplete,
}

/// Master key registers involved in a re-encipherment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReencipherRegister {
    Auto,
    ToNew,
    FromOld,
    FromOldToNew,
}

/// A name/value property of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyProperty {
    pub name: String,
    pub value: String,
}

/// A plugin specific option of a key operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOption {
    pub name: String,
    pub argument: Option<String>,
}

/// Collaborators of a plugin instance
pub struct PluginEnvironment {
    pub directory: Box<dyn AdapterDirectory>,
    pub providers: Box<dyn ProviderFactory>,
    pub confirm: Box<dyn Confirm>,
    /// Host name put into the default `subjectAltName`
    pub hostname: String,
}

impl PluginEnvironment {
    /// Interactive confirmation and the local host name
    pub fn new<D, F>(directory: D, providers: F) -> Self
    where
        D: AdapterDirectory + 'static,
        F: ProviderFactory + 'static,
    {
        Self {
            directory: Box::new(directory),
            providers: Box::new(providers),
            confirm: Box::new(Confirmation::Interactive),
            hostname: local_hostname(),
        }
    }

    /// Adapters from sysfs and the PKCS#11 provider configured in the environment
    pub fn system() -> KmsResult<Self> {
        Ok(Self::new(
            SysfsAdapterDirectory::default(),
            Pkcs11ProviderFactory::new(Pkcs11Settings::from_env()?),
        ))
    }

    pub fn with_confirm<C: Confirm + 'static>(mut self, confirm: C) -> Self {
        self.confirm = Box::new(confirm);
        self
    }

    pub fn with_hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = hostname.into();
        self
    }
}

impl fmt::Debug for PluginEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginEnvironment")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

fn local_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::warn!("Failed to determine the host name, using 'localhost': {}", e);
            "localhost".to_string()
        }
    }
}

/// Configuration summary for display by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub storage_dir: PathBuf,
    pub adapter_family: Option<AdapterFamily>,
    pub adapters: Vec<Endpoint>,
    pub bound_adapter: Option<Endpoint>,
    pub identity_key: Option<KeyMetadata>,
    pub client_certificate: Option<CertificateSummary>,
    pub complete: bool,
    pub missing: Vec<&'static str>,
}

/// One plugin instance bound to a storage directory
pub struct KmipPlugin {
    store: ConfigStore,
    binding: ProviderBinding,
    environment: PluginEnvironment,
    verbose: bool,
    last_error: Option<ErrorReport>,
}

impl fmt::Debug for KmipPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmipPlugin")
            .field("storage_dir", &self.store.storage_dir())
            .field("bound_adapter", &self.binding.bound_endpoint())
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

impl KmipPlugin {
    /// Check that `storage_dir` can hold a plugin configuration
    pub fn bind<P: AsRef<Path>>(storage_dir: P) -> KmsResult<()> {
        let storage_dir = storage_dir.as_ref();
        if !storage_dir.is_dir() {
            return Err(KmsError::config_error(
                "bind",
                &format!("{} is not a directory", storage_dir.display()),
                error_codes::CONFIG_LOAD_FAILED,
            ));
        }
        Ok(())
    }

    /// Open the plugin in `storage_dir` with the system collaborators
    pub fn initialize<P: AsRef<Path>>(storage_dir: P, verbose: bool) -> KmsResult<Self> {
        Self::with_environment(storage_dir, verbose, PluginEnvironment::system()?)
    }

    pub fn with_environment<P: AsRef<Path>>(
        storage_dir: P,
        verbose: bool,
        environment: PluginEnvironment,
    ) -> KmsResult<Self> {
        let store = ConfigStore::open(storage_dir)?;

        let plugin = Self {
            store,
            binding: ProviderBinding::new(),
            environment,
            verbose,
            last_error: None,
        };
        plugin.progress(format_args!(
            "Plugin initialized in {}, configuration is {}",
            plugin.store.storage_dir().display(),
            if plugin.is_complete() { "complete" } else { "incomplete" }
        ));

        Ok(plugin)
    }

    /// Release the crypto provider
    pub fn terminate(mut self) {
        self.progress(format_args!("Plugin terminating"));
        self.binding.unbind();
    }

    /// Message of the most recent failed operation
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_ref().map(|report| report.message.as_str())
    }

    /// Code, remediation hint and details of the most recent failure
    pub fn last_error_report(&self) -> Option<&ErrorReport> {
        self.last_error.as_ref()
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn is_complete(&self) -> bool {
        self.store.config().is_complete()
    }

    fn progress(&self, message: fmt::Arguments<'_>) {
        if self.verbose {
            log::info!("{}", message);
        } else {
            log::debug!("{}", message);
        }
    }

    fn record<T>(&mut self, result: KmsResult<T>) -> KmsResult<T> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(e) => {
                log::debug!("Operation failed: {:?}", e);
                self.last_error = Some(ErrorReport::from(e));
            }
        }
        result
    }

    /// Whether keys of `key_type` can be stored with the configured adapters
    pub fn supports_key_type(&self, key_type: &str) -> bool {
        let supported: &[&str] = match self.store.config().adapter_family {
            Some(family) => family.key_types(),
            None => &[KEY_TYPE_CCA_AESDATA, KEY_TYPE_CCA_AESCIPHER, KEY_TYPE_EP11_AES],
        };
        supported.iter().any(|t| t.eq_ignore_ascii_case(key_type))
    }

    /// Apply a (partial) configuration
    ///
    /// Returns [`ConfigureStatus::ContinueConfiguring`] while adapters,
    /// identity key or client certificate are still missing.
    pub fn configure(
        &mut self,
        adapters: Option<&[Endpoint]>,
        options: &[ConfigureOption],
    ) -> KmsResult<ConfigureStatus> {
        let result = self.configure_steps(adapters, options);
        self.record(result)
    }

    fn configure_steps(
        &mut self,
        adapters: Option<&[Endpoint]>,
        options: &[ConfigureOption],
    ) -> KmsResult<ConfigureStatus> {
        if adapters.is_none() && options.is_empty() {
            return Err(KmsError::invalid_request(
                "configure",
                "neither APQNs nor options are specified",
            ));
        }

        self.progress(format_args!("Configure"));
        for endpoint in adapters.unwrap_or_default() {
            self.progress(format_args!("  APQN: {}", endpoint));
        }
        for option in options {
            self.progress(format_args!("  Option: {}", option));
        }

        let plan = ConfigurePlan::parse(options)?;
        let family = adapters
            .map(|endpoints| self.validate_adapters(endpoints))
            .transpose()?;
        self.validate_plan(&plan, family.is_some())?;

        if let (Some(endpoints), Some(family)) = (adapters, family) {
            self.apply_adapters(family, endpoints)?;
        }

        if let Some(spec) = &plan.identity_key {
            self.ensure_bound()?;
            generate_identity_key(
                spec,
                &mut self.binding,
                &mut self.store,
                self.environment.confirm.as_mut(),
            )?;
            self.progress(format_args!("Generated identity key {}", spec));
        }

        if let Some(request) = &plan.certificate {
            self.ensure_bound()?;
            generate_certificate(
                request,
                &self.environment.hostname,
                &mut self.binding,
                &mut self.store,
                self.environment.confirm.as_mut(),
            )?;
            let kind = match request.mode {
                CertificateMode::Csr { .. } => "Certificate signing request",
                CertificateMode::SelfSigned { .. } => "Self-signed certificate",
            };
            self.progress(format_args!("{} written to {}", kind, request.output.display()));
        }

        if let Some(path) = &plan.client_cert {
            self.ensure_bound()?;
            adopt_client_certificate(
                path,
                &mut self.binding,
                &mut self.store,
                self.environment.confirm.as_mut(),
            )?;
            self.progress(format_args!("Client certificate {} adopted", path.display()));
        }

        let complete = self.is_complete();
        self.progress(format_args!(
            "Plugin configuration is {}complete",
            if complete { "" } else { "in" }
        ));

        Ok(if complete {
            ConfigureStatus::Complete
        } else {
            ConfigureStatus::ContinueConfiguring
        })
    }

    /// Family of `endpoints`, which must fit the persisted configuration
    fn validate_adapters(&self, endpoints: &[Endpoint]) -> KmsResult<AdapterFamily> {
        let directory = self.environment.directory.as_ref();
        let family = validate_endpoints(directory, endpoints)?;

        if let Some(configured) = self.store.config().adapter_family {
            if configured != family {
                return Err(KmsError::invalid_adapter(
                    &endpoints[0].to_string(),
                    &format!(
                        "APQN is of type {}, but the plugin is configured to use APQNs of type {}",
                        family, configured
                    ),
                    error_codes::ADAPTER_FAMILY_MISMATCH,
                ));
            }
        }

        if family == AdapterFamily::Cca {
            cross_check_master_keys(directory, endpoints)?;
        }

        self.progress(format_args!("APQNs checked for type {}", family));
        Ok(family)
    }

    /// Check the preconditions of every requested step before any is executed
    fn validate_plan(&self, plan: &ConfigurePlan, adapters_given: bool) -> KmsResult<()> {
        let config = self.store.config();
        let adapters_available = adapters_given || config.adapters_configured();

        if (plan.identity_key.is_some() || plan.certificate.is_some()) && !adapters_available {
            return Err(KmsError::incomplete("APQNs must be configured first"));
        }

        if let Some(request) = &plan.certificate {
            let key = match (&plan.identity_key, &config.identity_key) {
                (Some(spec), _) => *spec,
                (None, Some(record)) => KeySpec::from_metadata(&record.metadata)?,
                (None, None) => KeySpec::default_spec(),
            };
            request.prepare(&key, &self.environment.hostname)?;
        }

        if let Some(path) = &plan.client_cert {
            if !adapters_available {
                return Err(KmsError::incomplete("APQNs must be configured first"));
            }
            if plan.identity_key.is_none() && !config.identity_key_present() {
                return Err(KmsError::incomplete("the identity key must be generated first"));
            }
            load_certificate(path)?;
        }

        Ok(())
    }

    fn apply_adapters(&mut self, family: AdapterFamily, endpoints: &[Endpoint]) -> KmsResult<()> {
        let mut unique: Vec<Endpoint> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if !unique.contains(endpoint) {
                unique.push(*endpoint);
            }
        }

        self.binding.unbind();

        let config = self.store.config_mut();
        config.adapter_family = Some(family);
        config.adapter_endpoints = unique;
        self.store.save()?;

        self.ensure_bound()
    }

    /// Bind the provider for the configured adapters unless already bound
    fn ensure_bound(&mut self) -> KmsResult<()> {
        if self.binding.is_bound() {
            return Ok(());
        }

        let config = self.store.config();
        let family = config
            .adapter_family
            .ok_or_else(|| KmsError::incomplete("APQNs must be configured first"))?;

        self.binding.bind(
            family,
            &config.adapter_endpoints,
            self.environment.directory.as_ref(),
            self.environment.providers.as_ref(),
        )?;

        if let Some(endpoint) = self.binding.bound_endpoint() {
            self.progress(format_args!("Crypto provider bound to APQN {}", endpoint));
        }
        Ok(())
    }

    /// Remove every file of the plugin from the storage directory
    ///
    /// The backend objects of the identity key are destroyed first when the
    /// provider can still be reached.
    pub fn deconfigure(&mut self) -> KmsResult<()> {
        let result = self.remove_configuration();
        self.record(result)
    }

    fn remove_configuration(&mut self) -> KmsResult<()> {
        self.progress(format_args!("Deconfigure"));

        let config = self.store.config().clone();
        if config.identity_key_present() {
            if let Err(e) = self.destroy_identity_key() {
                log::warn!("Identity key objects were not destroyed: {}", e);
            }
        }
        self.binding.unbind();

        if let Some(record) = &config.identity_key {
            remove_if_exists(&record.path)?;
        }
        if let Some(record) = &config.client_certificate {
            remove_if_exists(&record.path)?;
        }
        if let Some(marker) = &config.identity_key_reenc {
            remove_if_exists(marker)?;
        }

        self.store.remove()
    }

    fn destroy_identity_key(&mut self) -> KmsResult<()> {
        let (blob, _) = load_identity_key(&self.store)?;
        self.ensure_bound()?;
        self.binding.provider()?.destroy_key(&blob)
    }

    /// Nothing to log in to; the identity is presented per connection
    pub fn login(&mut self) -> KmsResult<()> {
        self.progress(format_args!("Login"));
        self.record(Ok(()))
    }

    /// Describe the current configuration
    pub fn info(&mut self) -> KmsResult<PluginInfo> {
        let config = self.store.config();

        let client_certificate = match &config.client_certificate {
            Some(record) => match CertificateSummary::load(record) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    log::warn!("Failed to read the client certificate {}: {}", record.path.display(), e);
                    None
                }
            },
            None => None,
        };

        let info = PluginInfo {
            storage_dir: self.store.storage_dir().to_path_buf(),
            adapter_family: config.adapter_family,
            adapters: config.adapter_endpoints.clone(),
            bound_adapter: self.binding.bound_endpoint(),
            identity_key: config.identity_key.as_ref().map(|k| k.metadata.clone()),
            client_certificate,
            complete: config.is_complete(),
            missing: config.missing(),
        };

        self.record(Ok(info))
    }

    pub fn reencipher(
        &mut self,
        mode: ReencipherMode,
        register: ReencipherRegister,
        _options: &[KeyOption],
    ) -> KmsResult<()> {
        log::debug!("Re-encipher requested with {:?} / {:?}", mode, register);
        self.unsupported("reencipher")
    }

    pub fn generate_key(
        &mut self,
        key_type: &str,
        _properties: &[KeyProperty],
        _options: &[KeyOption],
    ) -> KmsResult<String> {
        log::debug!("Generate key of type {} requested", key_type);
        self.unsupported("generate_key")
    }

    pub fn set_key_properties(&mut self, _key_id: &str, _properties: &[KeyProperty]) -> KmsResult<()> {
        self.unsupported("set_key_properties")
    }

    pub fn get_key_properties(&mut self, _key_id: &str) -> KmsResult<Vec<KeyProperty>> {
        self.unsupported("get_key_properties")
    }

    pub fn remove_key(&mut self, _key_id: &str, _options: &[KeyOption]) -> KmsResult<()> {
        self.unsupported("remove_key")
    }

    pub fn list_keys(
        &mut self,
        _label_pattern: Option<&str>,
        _properties: &[KeyProperty],
        _options: &[KeyOption],
    ) -> KmsResult<Vec<String>> {
        self.unsupported("list_keys")
    }

    pub fn import_key(&mut self, _key_id: &str, _options: &[KeyOption]) -> KmsResult<Vec<u8>> {
        self.unsupported("import_key")
    }

    fn unsupported<T>(&mut self, operation: &str) -> KmsResult<T> {
        self.record(Err(KmsError::unsupported(operation)))
    }
}

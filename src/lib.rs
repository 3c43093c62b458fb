/*!
 * KMIP Plugin Identity Management
 *
 * This crate manages the configuration and the cryptographic identity of a
 * key-management plugin that authenticates to a KMIP server with an
 * HSM-backed client certificate.
 *
 * The configuration is built up over one or more `configure` calls:
 *
 * - Crypto adapter endpoints (APQNs) of one adapter family (CCA or EP11)
 * - An identity key generated inside the HSM
 * - A client certificate, either self-signed, issued for a generated
 *   certificate signing request, or adopted from an external issuer
 *
 * Certificates and requests always carry the `clientAuth` extended key usage
 * and a `subjectAltName`, and an adopted certificate must hold the public key
 * of the identity key.
 */

/// Crypto adapter endpoints, families and master key checks
pub mod adapter;

/// Certificate signing requests, self-signed and adopted client certificates
pub mod certificate;

/// Confirmation of destructive operations
pub mod confirm;

/// Common error types of the plugin
pub mod error;

/// Identity key specification and generation
pub mod identity;

/// Host-facing plugin lifecycle and the `configure` state machine
pub mod plugin;

/// Crypto providers and their binding to an adapter endpoint
pub mod provider;

/// Persisted plugin configuration
pub mod store;

pub use adapter::{AdapterDirectory, AdapterFamily, Endpoint};
pub use error::{ErrorKind, ErrorReport, KmsError, KmsResult};
pub use plugin::{ConfigureOption, ConfigureStatus, KmipPlugin, PluginEnvironment, PluginInfo};

/// The types most hosts need
pub mod prelude {
    pub use crate::adapter::{
        AdapterDirectory, AdapterFamily, Endpoint, StaticAdapterDirectory, SysfsAdapterDirectory,
    };
    pub use crate::certificate::{CertificateAlgorithm, CertificateSummary};
    pub use crate::confirm::{Confirm, Confirmation};
    pub use crate::error::{ErrorKind, ErrorReport, KmsError, KmsResult};
    pub use crate::identity::{EcCurve, KeySpec};
    pub use crate::plugin::{
        ConfigureOption, ConfigureStatus, KmipPlugin, PluginEnvironment, PluginInfo,
    };
    pub use crate::provider::{
        Pkcs11ProviderFactory, Pkcs11Settings, ProviderFactory, SoftwareProviderFactory,
    };
}

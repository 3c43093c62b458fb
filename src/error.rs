/*!
 * Error Handling for the KMIP Plugin
 *
 * Provides the error taxonomy shared by every layer of the plugin, with
 * numeric error codes, user-friendly messages, and suggested remediation.
 */

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

/// Error type for all plugin operations
#[derive(Debug, Error)]
pub enum KmsError {
    #[error("Invalid key specification '{spec}': {reason}")]
    InvalidKeySpec {
        spec: String,
        reason: String,
        error_code: u32,
    },

    #[error("Invalid request: {parameter} - {reason}")]
    InvalidRequest {
        parameter: String,
        reason: String,
        error_code: u32,
    },

    #[error("The client certificate's public key does not match the identity key")]
    KeyMismatch {
        certificate: String,
        error_code: u32,
    },

    #[error("Your CCA APKA master key setup is improper: {details}")]
    InconsistentAdapterSetup { details: String, error_code: u32 },

    #[error("None of the associated APQNs is available: {endpoints}")]
    NoAvailableEndpoint { endpoints: String, error_code: u32 },

    #[error("Invalid adapter {endpoint}: {reason}")]
    InvalidAdapter {
        endpoint: String,
        reason: String,
        error_code: u32,
    },

    #[error("Operation aborted by user: {operation}")]
    OperationCancelled { operation: String, error_code: u32 },

    #[error("Operation not supported: {operation}")]
    Unsupported { operation: String, error_code: u32 },

    #[error("Provider operation failed: {operation} - {cause}")]
    ProviderError {
        operation: String,
        cause: String,
        error_code: u32,
        context: HashMap<String, String>,
    },

    #[error("Configuration incomplete: {missing}")]
    IncompleteConfiguration { missing: String, error_code: u32 },

    #[error("Configuration store error: {operation} - {cause}")]
    ConfigurationError {
        operation: String,
        cause: String,
        error_code: u32,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Structured error kind, independent of the message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidKeySpec,
    InvalidRequest,
    KeyMismatch,
    InconsistentAdapterSetup,
    NoAvailableEndpoint,
    InvalidAdapter,
    OperationCancelled,
    Unsupported,
    ProviderError,
    IncompleteConfiguration,
    ConfigurationError,
    SerializationError,
    IoError,
}

/// Error code constants for different error categories
pub mod error_codes {
    // Request validation errors: 1000-1999
    pub const INVALID_KEY_SPEC: u32 = 1001;
    pub const INVALID_REQUEST: u32 = 1002;
    pub const INVALID_SUBJECT: u32 = 1003;
    pub const INVALID_EXTENSION: u32 = 1004;
    pub const DUPLICATE_ENTRY: u32 = 1005;
    pub const UNSUPPORTED_DIGEST: u32 = 1006;
    pub const CONFLICTING_OPTIONS: u32 = 1007;

    // Certificate errors: 2000-2999
    pub const KEY_MISMATCH: u32 = 2001;

    // Adapter errors: 3000-3999
    pub const INCONSISTENT_ADAPTER_SETUP: u32 = 3001;
    pub const NO_AVAILABLE_ENDPOINT: u32 = 3002;
    pub const UNKNOWN_ADAPTER: u32 = 3003;
    pub const ADAPTER_OFFLINE: u32 = 3004;
    pub const ADAPTER_FAMILY_MISMATCH: u32 = 3005;

    // User interaction errors: 4000-4999
    pub const OPERATION_CANCELLED: u32 = 4001;

    // Reserved surface: 5000-5999
    pub const UNSUPPORTED_OPERATION: u32 = 5001;

    // Provider errors: 6000-6999
    pub const PROVIDER_LOAD_FAILED: u32 = 6001;
    pub const PROVIDER_KEY_GENERATION_FAILED: u32 = 6002;
    pub const PROVIDER_SIGNING_FAILED: u32 = 6003;
    pub const PROVIDER_PUBLIC_KEY_FAILED: u32 = 6004;
    pub const PROVIDER_INVALID_BLOB: u32 = 6005;
    pub const PROVIDER_KEY_DESTROY_FAILED: u32 = 6006;

    // State errors: 7000-7999
    pub const INCOMPLETE_CONFIGURATION: u32 = 7001;

    // Store errors: 8000-8999
    pub const CONFIG_LOAD_FAILED: u32 = 8001;
    pub const CONFIG_SAVE_FAILED: u32 = 8002;
    pub const CONFIG_VERSION_UNSUPPORTED: u32 = 8003;
}

impl KmsError {
    /// Get the numeric error code for this error
    pub fn error_code(&self) -> u32 {
        match self {
            KmsError::InvalidKeySpec { error_code, .. } => *error_code,
            KmsError::InvalidRequest { error_code, .. } => *error_code,
            KmsError::KeyMismatch { error_code, .. } => *error_code,
            KmsError::InconsistentAdapterSetup { error_code, .. } => *error_code,
            KmsError::NoAvailableEndpoint { error_code, .. } => *error_code,
            KmsError::InvalidAdapter { error_code, .. } => *error_code,
            KmsError::OperationCancelled { error_code, .. } => *error_code,
            KmsError::Unsupported { error_code, .. } => *error_code,
            KmsError::ProviderError { error_code, .. } => *error_code,
            KmsError::IncompleteConfiguration { error_code, .. } => *error_code,
            KmsError::ConfigurationError { error_code, .. } => *error_code,
            KmsError::SerializationError(_) => 9001,
            KmsError::IoError(_) => 9002,
        }
    }

    /// Get the structured error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            KmsError::InvalidKeySpec { .. } => ErrorKind::InvalidKeySpec,
            KmsError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            KmsError::KeyMismatch { .. } => ErrorKind::KeyMismatch,
            KmsError::InconsistentAdapterSetup { .. } => ErrorKind::InconsistentAdapterSetup,
            KmsError::NoAvailableEndpoint { .. } => ErrorKind::NoAvailableEndpoint,
            KmsError::InvalidAdapter { .. } => ErrorKind::InvalidAdapter,
            KmsError::OperationCancelled { .. } => ErrorKind::OperationCancelled,
            KmsError::Unsupported { .. } => ErrorKind::Unsupported,
            KmsError::ProviderError { .. } => ErrorKind::ProviderError,
            KmsError::IncompleteConfiguration { .. } => ErrorKind::IncompleteConfiguration,
            KmsError::ConfigurationError { .. } => ErrorKind::ConfigurationError,
            KmsError::SerializationError(_) => ErrorKind::SerializationError,
            KmsError::IoError(_) => ErrorKind::IoError,
        }
    }

    /// Get a user-friendly error message
    pub fn user_friendly_message(&self) -> String {
        match self {
            KmsError::InvalidKeySpec { spec, .. } => {
                format!(
                    "The key specification '{}' is not valid. Use 'RSA:<bits>' or 'EC:<curve>'.",
                    spec
                )
            }
            KmsError::InvalidRequest { parameter, reason, .. } => {
                format!("The request is not valid ({}): {}.", parameter, reason)
            }
            KmsError::KeyMismatch { .. } => {
                "The client certificate's public key does not match the identity key.".to_string()
            }
            KmsError::InconsistentAdapterSetup { .. } => {
                "Your CCA APKA master key setup is improper.".to_string()
            }
            KmsError::NoAvailableEndpoint { .. } => {
                "None of the associated APQNs is available.".to_string()
            }
            KmsError::InvalidAdapter { endpoint, reason, .. } => {
                format!("APQN {} cannot be used: {}.", endpoint, reason)
            }
            KmsError::OperationCancelled { .. } => "Operation aborted by user.".to_string(),
            KmsError::Unsupported { operation, .. } => {
                format!("Operation '{}' is not supported by this plugin.", operation)
            }
            KmsError::ProviderError { operation, .. } => {
                format!(
                    "The cryptographic provider failed during '{}'. The HSM may be unavailable.",
                    operation
                )
            }
            KmsError::IncompleteConfiguration { missing, .. } => {
                format!("The plugin is not configured sufficiently: {}.", missing)
            }
            KmsError::ConfigurationError { operation, .. } => {
                format!(
                    "The plugin configuration could not be processed during '{}'.",
                    operation
                )
            }
            KmsError::SerializationError(_) => {
                "Data serialization failed. Data format may be corrupted.".to_string()
            }
            KmsError::IoError(_) => {
                "Input/output operation failed. Check file permissions and disk space.".to_string()
            }
        }
    }

    /// Get technical details for debugging
    pub fn technical_details(&self) -> HashMap<String, String> {
        let mut details = HashMap::new();

        details.insert("error_code".to_string(), self.error_code().to_string());
        details.insert("error_type".to_string(), self.error_type().to_string());
        details.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());

        match self {
            KmsError::ProviderError {
                operation,
                cause,
                context,
                ..
            } => {
                details.insert("operation".to_string(), operation.clone());
                details.insert("cause".to_string(), cause.clone());
                details.extend(context.clone());
            }
            KmsError::InvalidRequest {
                parameter, reason, ..
            } => {
                details.insert("parameter".to_string(), parameter.clone());
                details.insert("reason".to_string(), reason.clone());
            }
            KmsError::InvalidKeySpec { spec, reason, .. } => {
                details.insert("spec".to_string(), spec.clone());
                details.insert("reason".to_string(), reason.clone());
            }
            KmsError::InvalidAdapter {
                endpoint, reason, ..
            } => {
                details.insert("endpoint".to_string(), endpoint.clone());
                details.insert("reason".to_string(), reason.clone());
            }
            _ => {
                details.insert("details".to_string(), self.to_string());
            }
        }

        details
    }

    /// Get suggested remediation steps
    pub fn suggested_remediation(&self) -> Option<String> {
        match self {
            KmsError::InvalidKeySpec { .. } => Some(
                "Use RSA with 512, 1024, 2048 or 4096 bits, or EC with secp256r1, secp384r1 or secp521r1."
                    .to_string(),
            ),
            KmsError::InvalidRequest { error_code, .. } => match *error_code {
                error_codes::UNSUPPORTED_DIGEST => {
                    Some("Use one of sha224, sha256, sha384 or sha512.".to_string())
                }
                error_codes::DUPLICATE_ENTRY => {
                    Some("Specify each subject attribute and extension only once.".to_string())
                }
                _ => None,
            },
            KmsError::InconsistentAdapterSetup { .. } => Some(
                "Ensure that all APQNs have the same APKA master key set and that it is valid."
                    .to_string(),
            ),
            KmsError::NoAvailableEndpoint { .. } | KmsError::InvalidAdapter { .. } => Some(
                "Check that the crypto adapters are online and of the configured type.".to_string(),
            ),
            KmsError::IncompleteConfiguration { .. } => {
                Some("Run the configuration again and supply the missing settings.".to_string())
            }
            KmsError::KeyMismatch { .. } => Some(
                "Use a certificate issued for a request generated from the current identity key."
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Get the error category/type as a string
    pub fn error_type(&self) -> &'static str {
        match self {
            KmsError::InvalidKeySpec { .. } => "InvalidKeySpec",
            KmsError::InvalidRequest { .. } => "InvalidRequest",
            KmsError::KeyMismatch { .. } => "KeyMismatch",
            KmsError::InconsistentAdapterSetup { .. } => "InconsistentAdapterSetup",
            KmsError::NoAvailableEndpoint { .. } => "NoAvailableEndpoint",
            KmsError::InvalidAdapter { .. } => "InvalidAdapter",
            KmsError::OperationCancelled { .. } => "OperationCancelled",
            KmsError::Unsupported { .. } => "Unsupported",
            KmsError::ProviderError { .. } => "ProviderError",
            KmsError::IncompleteConfiguration { .. } => "IncompleteConfiguration",
            KmsError::ConfigurationError { .. } => "ConfigurationError",
            KmsError::SerializationError(_) => "SerializationError",
            KmsError::IoError(_) => "IoError",
        }
    }
}

/// Convenience constructors for common error types
impl KmsError {
    pub fn invalid_key_spec(spec: &str, reason: &str) -> Self {
        KmsError::InvalidKeySpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
            error_code: error_codes::INVALID_KEY_SPEC,
        }
    }

    pub fn invalid_request(parameter: &str, reason: &str) -> Self {
        Self::invalid_request_with_code(parameter, reason, error_codes::INVALID_REQUEST)
    }

    pub fn invalid_request_with_code(parameter: &str, reason: &str, error_code: u32) -> Self {
        KmsError::InvalidRequest {
            parameter: parameter.to_string(),
            reason: reason.to_string(),
            error_code,
        }
    }

    pub fn key_mismatch(certificate: &str) -> Self {
        KmsError::KeyMismatch {
            certificate: certificate.to_string(),
            error_code: error_codes::KEY_MISMATCH,
        }
    }

    pub fn inconsistent_adapter_setup(details: &str) -> Self {
        KmsError::InconsistentAdapterSetup {
            details: details.to_string(),
            error_code: error_codes::INCONSISTENT_ADAPTER_SETUP,
        }
    }

    pub fn no_available_endpoint(endpoints: &str) -> Self {
        KmsError::NoAvailableEndpoint {
            endpoints: endpoints.to_string(),
            error_code: error_codes::NO_AVAILABLE_ENDPOINT,
        }
    }

    pub fn invalid_adapter(endpoint: &str, reason: &str, error_code: u32) -> Self {
        KmsError::InvalidAdapter {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
            error_code,
        }
    }

    pub fn cancelled(operation: &str) -> Self {
        KmsError::OperationCancelled {
            operation: operation.to_string(),
            error_code: error_codes::OPERATION_CANCELLED,
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        KmsError::Unsupported {
            operation: operation.to_string(),
            error_code: error_codes::UNSUPPORTED_OPERATION,
        }
    }

    pub fn provider_error(operation: &str, cause: &str, error_code: u32) -> Self {
        KmsError::ProviderError {
            operation: operation.to_string(),
            cause: cause.to_string(),
            error_code,
            context: HashMap::new(),
        }
    }

    /// Provider error carrying the backend and endpoint it came from
    pub fn provider_error_at(
        operation: &str,
        cause: &str,
        error_code: u32,
        backend: &str,
        endpoint: &str,
    ) -> Self {
        let mut context = HashMap::new();
        context.insert("backend".to_string(), backend.to_string());
        context.insert("endpoint".to_string(), endpoint.to_string());

        KmsError::ProviderError {
            operation: operation.to_string(),
            cause: cause.to_string(),
            error_code,
            context,
        }
    }

    pub fn incomplete(missing: &str) -> Self {
        KmsError::IncompleteConfiguration {
            missing: missing.to_string(),
            error_code: error_codes::INCOMPLETE_CONFIGURATION,
        }
    }

    pub fn config_error(operation: &str, cause: &str, error_code: u32) -> Self {
        KmsError::ConfigurationError {
            operation: operation.to_string(),
            cause: cause.to_string(),
            error_code,
        }
    }
}

/// What a host is told about a failed operation
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub error_code: u32,
    pub error_type: &'static str,
    pub user_message: String,
    pub remediation: Option<String>,
    pub details: HashMap<String, String>,
}

impl From<&KmsError> for ErrorReport {
    fn from(error: &KmsError) -> Self {
        Self {
            message: error.to_string(),
            error_code: error.error_code(),
            error_type: error.error_type(),
            user_message: error.user_friendly_message(),
            remediation: error.suggested_remediation(),
            details: error.technical_details(),
        }
    }
}

impl From<std::io::Error> for KmsError {
    fn from(err: std::io::Error) -> Self {
        KmsError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for KmsError {
    fn from(err: serde_json::Error) -> Self {
        KmsError::SerializationError(err.to_string())
    }
}

impl From<der::Error> for KmsError {
    fn from(err: der::Error) -> Self {
        KmsError::SerializationError(format!("DER encoding failed: {}", err))
    }
}

/// Result type for plugin operations
pub type KmsResult<T> = Result<T, KmsError>;

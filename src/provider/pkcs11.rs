/*!
 * PKCS #11 Provider
 *
 * Identity keys are generated as non-extractable token objects. The key
 * blob kept by the plugin only references the objects by their CKA_ID,
 * so the private key never leaves the token.
 *
 * The library, PIN and endpoint-to-slot mapping come from
 * [`Pkcs11Settings`].
 */

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use const_oid::db::rfc5912::{ID_EC_PUBLIC_KEY, ID_RSASSA_PSS};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::{AuthPin, Ulong};
use der::asn1::{Any, BitString, OctetString, Uint};
use der::{Decode, Encode, Sequence};
use rsa::pkcs8::EncodePublicKey;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use zeroize::Zeroizing;

use super::{CryptoProvider, DigestAlgorithm, KeyBlob, ProviderFactory, SignatureScheme};
use crate::adapter::{AdapterFamily, Endpoint};
use crate::error::{error_codes, KmsError, KmsResult};
use crate::identity::{EcCurve, KeySpec};
use crate::store::KeyMetadata;

/// Environment variable naming the PKCS #11 module
pub const ENV_LIBRARY: &str = "KMIP_PLUGIN_PKCS11_LIBRARY";
/// Environment variable holding the user PIN
pub const ENV_PIN: &str = "KMIP_PLUGIN_PKCS11_PIN";
/// Environment variable mapping endpoints to slots, e.g. `3.12=4,4.12=5`
pub const ENV_SLOTS: &str = "KMIP_PLUGIN_PKCS11_SLOTS";
/// Environment variable selecting a token by label
pub const ENV_TOKEN_LABEL: &str = "KMIP_PLUGIN_PKCS11_TOKEN";

/// Module used when none is configured
pub const DEFAULT_LIBRARY: &str = "/usr/lib64/opencryptoki/libopencryptoki.so";

const BACKEND: &str = "PKCS#11";
const KEY_LABEL: &str = "kmip-plugin-identity";

/// How to reach the token for an endpoint
#[derive(Clone, Default)]
pub struct Pkcs11Settings {
    pub library_path: PathBuf,
    pub user_pin: Option<Zeroizing<String>>,
    /// Slot per endpoint; endpoints not listed fall back to the token label
    pub slots: BTreeMap<Endpoint, u64>,
    pub token_label: Option<String>,
}

impl fmt::Debug for Pkcs11Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Settings")
            .field("library_path", &self.library_path)
            .field("user_pin", &"[REDACTED]")
            .field("slots", &self.slots)
            .field("token_label", &self.token_label)
            .finish()
    }
}

impl Pkcs11Settings {
    pub fn new<P: AsRef<Path>>(library_path: P) -> Self {
        Self {
            library_path: library_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Read the settings from the `KMIP_PLUGIN_PKCS11_*` environment
    pub fn from_env() -> KmsResult<Self> {
        let library_path = std::env::var(ENV_LIBRARY).unwrap_or_else(|_| DEFAULT_LIBRARY.to_string());
        let mut settings = Self::new(library_path);

        settings.user_pin = std::env::var(ENV_PIN).ok().map(Zeroizing::new);
        settings.token_label = std::env::var(ENV_TOKEN_LABEL).ok();
        if let Ok(slots) = std::env::var(ENV_SLOTS) {
            settings.slots = parse_slot_map(&slots)?;
        }

        Ok(settings)
    }
}

/// Parse `endpoint=slot` pairs separated by commas
pub fn parse_slot_map(value: &str) -> KmsResult<BTreeMap<Endpoint, u64>> {
    let mut slots = BTreeMap::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (endpoint, slot) = entry.split_once('=').ok_or_else(|| {
            KmsError::invalid_request(ENV_SLOTS, &format!("entry '{}' is not of the form APQN=slot", entry))
        })?;
        let endpoint: Endpoint = endpoint.parse()?;
        let slot = slot
            .trim()
            .parse::<u64>()
            .map_err(|_| KmsError::invalid_request(ENV_SLOTS, &format!("slot '{}' is not a number", slot)))?;
        slots.insert(endpoint, slot);
    }

    Ok(slots)
}

/// Opens [`Pkcs11Provider`]s
#[derive(Debug, Clone)]
pub struct Pkcs11ProviderFactory {
    settings: Pkcs11Settings,
}

impl Pkcs11ProviderFactory {
    pub fn new(settings: Pkcs11Settings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Pkcs11Settings {
        &self.settings
    }
}

impl ProviderFactory for Pkcs11ProviderFactory {
    fn open(&self, family: AdapterFamily, endpoint: Endpoint) -> KmsResult<Box<dyn CryptoProvider>> {
        Ok(Box::new(Pkcs11Provider::connect(&self.settings, family, endpoint)?))
    }
}

fn load_failed(endpoint: Endpoint, cause: String) -> KmsError {
    KmsError::provider_error_at("open", &cause, error_codes::PROVIDER_LOAD_FAILED, BACKEND, &endpoint.to_string())
}

/// Provider holding one logged-in session on the endpoint's token
pub struct Pkcs11Provider {
    family: AdapterFamily,
    endpoint: Endpoint,
    context: Option<Pkcs11>,
    session: Option<Session>,
}

impl fmt::Debug for Pkcs11Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Provider")
            .field("family", &self.family)
            .field("endpoint", &self.endpoint)
            .field("open", &self.session.is_some())
            .finish()
    }
}

impl Pkcs11Provider {
    pub fn connect(settings: &Pkcs11Settings, family: AdapterFamily, endpoint: Endpoint) -> KmsResult<Self> {
        if !settings.library_path.exists() {
            return Err(load_failed(
                endpoint,
                format!("PKCS#11 library not found: {}", settings.library_path.display()),
            ));
        }

        log::debug!("Initializing PKCS#11 library: {}", settings.library_path.display());

        let context = Pkcs11::new(&settings.library_path)
            .map_err(|e| load_failed(endpoint, format!("Failed to load PKCS#11 library: {}", e)))?;
        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| load_failed(endpoint, format!("Failed to initialize PKCS#11 library: {}", e)))?;

        let slot = Self::select_slot(&context, settings, endpoint)?;
        log::debug!("Using slot {} for APQN {}", slot.id(), endpoint);

        let session = context
            .open_rw_session(slot)
            .map_err(|e| load_failed(endpoint, format!("Failed to open session: {}", e)))?;

        if let Some(pin) = &settings.user_pin {
            let auth_pin = AuthPin::new(pin.as_str().to_string());
            session
                .login(UserType::User, Some(&auth_pin))
                .map_err(|e| load_failed(endpoint, format!("Failed to login to token: {}", e)))?;
        }

        Ok(Self {
            family,
            endpoint,
            context: Some(context),
            session: Some(session),
        })
    }

    fn select_slot(context: &Pkcs11, settings: &Pkcs11Settings, endpoint: Endpoint) -> KmsResult<Slot> {
        let slots = context
            .get_slots_with_token()
            .map_err(|e| load_failed(endpoint, format!("Failed to get slots: {}", e)))?;

        if let Some(slot_id) = settings.slots.get(&endpoint) {
            return slots
                .into_iter()
                .find(|s| s.id() == *slot_id)
                .ok_or_else(|| load_failed(endpoint, format!("Slot {} not found", slot_id)));
        }

        if let Some(label) = &settings.token_label {
            return slots
                .into_iter()
                .find(|s| {
                    context
                        .get_token_info(*s)
                        .map(|info| info.label().trim() == label.trim())
                        .unwrap_or(false)
                })
                .ok_or_else(|| load_failed(endpoint, format!("Token with label '{}' not found", label)));
        }

        slots
            .into_iter()
            .next()
            .ok_or_else(|| load_failed(endpoint, "No slots with tokens found".to_string()))
    }

    fn session(&self) -> KmsResult<&Session> {
        self.session.as_ref().ok_or_else(|| {
            KmsError::provider_error_at(
                "session",
                "No active session",
                error_codes::PROVIDER_LOAD_FAILED,
                BACKEND,
                &self.endpoint.to_string(),
            )
        })
    }

    fn find_object(&self, reference: &TokenKeyRef, class: ObjectClass) -> KmsResult<ObjectHandle> {
        let id = hex::decode(&reference.id).map_err(|e| invalid_blob(&e.to_string()))?;
        let template = [Attribute::Class(class), Attribute::Id(id)];

        self.session()?
            .find_objects(&template)
            .map_err(|e| invalid_blob(&format!("object lookup failed: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| invalid_blob(&format!("no {:?} object with id {}", class, reference.id)))
    }

    fn rsa_public_key(&self, handle: ObjectHandle) -> KmsResult<Vec<u8>> {
        let attributes = self
            .session()?
            .get_attributes(handle, &[AttributeType::Modulus, AttributeType::PublicExponent])
            .map_err(|e| public_key_failed(&e.to_string()))?;

        let mut modulus = None;
        let mut exponent = None;
        for attribute in attributes {
            match attribute {
                Attribute::Modulus(m) => modulus = Some(m),
                Attribute::PublicExponent(e) => exponent = Some(e),
                _ => {}
            }
        }

        let (modulus, exponent) = modulus
            .zip(exponent)
            .ok_or_else(|| public_key_failed("modulus or public exponent missing"))?;

        let key = RsaPublicKey::new(BigUint::from_bytes_be(&modulus), BigUint::from_bytes_be(&exponent))
            .map_err(|e| public_key_failed(&e.to_string()))?;
        let document = key.to_public_key_der().map_err(|e| public_key_failed(&e.to_string()))?;

        Ok(document.as_bytes().to_vec())
    }

    fn ec_public_key(&self, handle: ObjectHandle, curve: EcCurve) -> KmsResult<Vec<u8>> {
        let attributes = self
            .session()?
            .get_attributes(handle, &[AttributeType::EcPoint])
            .map_err(|e| public_key_failed(&e.to_string()))?;

        let point = attributes
            .into_iter()
            .find_map(|a| match a {
                Attribute::EcPoint(point) => Some(point),
                _ => None,
            })
            .ok_or_else(|| public_key_failed("EC point missing"))?;

        // CKA_EC_POINT is a DER OCTET STRING; some tokens return the raw point
        let point = match OctetString::from_der(&point) {
            Ok(wrapped) if wrapped.as_bytes().first() == Some(&0x04) => wrapped.as_bytes().to_vec(),
            _ => point,
        };

        let spki = SubjectPublicKeyInfoOwned {
            algorithm: AlgorithmIdentifierOwned {
                oid: ID_EC_PUBLIC_KEY,
                parameters: Some(Any::from(curve.oid())),
            },
            subject_public_key: BitString::from_bytes(&point)?,
        };

        Ok(spki.to_der()?)
    }
}

/// Token objects of an identity key
#[derive(Debug, Serialize, Deserialize)]
struct TokenKeyRef {
    label: String,
    /// CKA_ID, hex encoded
    id: String,
    #[serde(flatten)]
    metadata: KeyMetadata,
}

impl TokenKeyRef {
    fn decode(blob: &KeyBlob) -> KmsResult<(Self, KeySpec)> {
        let reference: TokenKeyRef =
            serde_json::from_slice(blob.as_bytes()).map_err(|e| invalid_blob(&e.to_string()))?;
        let spec = KeySpec::from_metadata(&reference.metadata)?;
        Ok((reference, spec))
    }
}

/// DER ECDSA-Sig-Value
#[derive(Sequence)]
struct EcdsaSigValue {
    r: Uint,
    s: Uint,
}

fn invalid_blob(cause: &str) -> KmsError {
    KmsError::provider_error("decode key blob", cause, error_codes::PROVIDER_INVALID_BLOB)
}

fn public_key_failed(cause: &str) -> KmsError {
    KmsError::provider_error("public key", cause, error_codes::PROVIDER_PUBLIC_KEY_FAILED)
}

fn signing_failed(cause: &str) -> KmsError {
    KmsError::provider_error("sign", cause, error_codes::PROVIDER_SIGNING_FAILED)
}

fn pss_params(digest: DigestAlgorithm) -> PkcsPssParams {
    let (hash_alg, mgf) = match digest {
        DigestAlgorithm::Sha224 => (MechanismType::SHA224, PkcsMgfType::MGF1_SHA224),
        DigestAlgorithm::Sha256 => (MechanismType::SHA256, PkcsMgfType::MGF1_SHA256),
        DigestAlgorithm::Sha384 => (MechanismType::SHA384, PkcsMgfType::MGF1_SHA384),
        DigestAlgorithm::Sha512 => (MechanismType::SHA512, PkcsMgfType::MGF1_SHA512),
    };

    PkcsPssParams {
        hash_alg,
        mgf,
        s_len: Ulong::from(digest.output_len() as u64),
    }
}

/// Convert a raw `r || s` signature into DER
fn ecdsa_raw_to_der(raw: &[u8]) -> KmsResult<Vec<u8>> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(signing_failed(&format!("unexpected ECDSA signature length {}", raw.len())));
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let value = EcdsaSigValue {
        r: Uint::new(r)?,
        s: Uint::new(s)?,
    };
    Ok(value.to_der()?)
}

impl CryptoProvider for Pkcs11Provider {
    fn family(&self) -> AdapterFamily {
        self.family
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn generate_key(&mut self, spec: &KeySpec) -> KmsResult<KeyBlob> {
        let id = uuid::Uuid::new_v4().as_bytes().to_vec();
        let label = KEY_LABEL.as_bytes().to_vec();

        let (mechanism, mut public_template) = match spec {
            KeySpec::Rsa { bits } => (
                Mechanism::RsaPkcsKeyPairGen,
                vec![
                    Attribute::ModulusBits(Ulong::from(u64::from(*bits))),
                    Attribute::PublicExponent(vec![0x01, 0x00, 0x01]),
                ],
            ),
            KeySpec::Ec { curve } => (
                Mechanism::EccKeyPairGen,
                vec![Attribute::EcParams(curve.oid().to_der()?)],
            ),
        };
        public_template.extend([
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::Label(label.clone()),
            Attribute::Id(id.clone()),
        ]);

        let private_template = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Sign(true),
            Attribute::Extractable(false),
            Attribute::Label(label),
            Attribute::Id(id.clone()),
        ];

        self.session()?
            .generate_key_pair(&mechanism, &public_template, &private_template)
            .map_err(|e| {
                KmsError::provider_error_at(
                    "generate key",
                    &format!("Failed to generate {} key pair: {}", spec, e),
                    error_codes::PROVIDER_KEY_GENERATION_FAILED,
                    BACKEND,
                    &self.endpoint.to_string(),
                )
            })?;

        let reference = TokenKeyRef {
            label: KEY_LABEL.to_string(),
            id: hex::encode(&id),
            metadata: spec.metadata(),
        };
        log::debug!("Generated {} key {} on APQN {}", spec, reference.id, self.endpoint);

        Ok(KeyBlob::new(serde_json::to_vec(&reference)?))
    }

    fn public_key(&mut self, blob: &KeyBlob, rsa_pss: bool) -> KmsResult<SubjectPublicKeyInfoOwned> {
        let (reference, spec) = TokenKeyRef::decode(blob)?;
        let handle = self.find_object(&reference, ObjectClass::PUBLIC_KEY)?;

        let der = match spec {
            KeySpec::Rsa { .. } => self.rsa_public_key(handle)?,
            KeySpec::Ec { curve } => self.ec_public_key(handle, curve)?,
        };
        let mut spki = SubjectPublicKeyInfoOwned::from_der(&der)?;

        if rsa_pss && matches!(spec, KeySpec::Rsa { .. }) {
            spki.algorithm = AlgorithmIdentifierOwned {
                oid: ID_RSASSA_PSS,
                parameters: None,
            };
        }

        Ok(spki)
    }

    fn sign(&mut self, blob: &KeyBlob, scheme: &SignatureScheme, message: &[u8]) -> KmsResult<Vec<u8>> {
        let (reference, spec) = TokenKeyRef::decode(blob)?;
        let handle = self.find_object(&reference, ObjectClass::PRIVATE_KEY)?;

        let (mechanism, data) = match (spec, scheme) {
            (KeySpec::Rsa { .. }, SignatureScheme::RsaPkcs1v15(d)) => (Mechanism::RsaPkcs, d.digest_info(message)?),
            (KeySpec::Rsa { .. }, SignatureScheme::RsaPss(d)) => {
                (Mechanism::RsaPkcsPss(pss_params(*d)), d.digest(message))
            }
            (KeySpec::Ec { .. }, SignatureScheme::Ecdsa(d)) => (Mechanism::Ecdsa, d.digest(message)),
            _ => {
                return Err(signing_failed(&format!(
                    "signature scheme {:?} does not fit a {} key",
                    scheme, spec
                )))
            }
        };

        let signature = self
            .session()?
            .sign(&mechanism, handle, &data)
            .map_err(|e| signing_failed(&format!("token signing failed: {}", e)))?;

        match scheme {
            SignatureScheme::Ecdsa(_) => ecdsa_raw_to_der(&signature),
            _ => Ok(signature),
        }
    }

    fn destroy_key(&mut self, blob: &KeyBlob) -> KmsResult<()> {
        let (reference, _) = TokenKeyRef::decode(blob)?;
        let id = hex::decode(&reference.id).map_err(|e| invalid_blob(&e.to_string()))?;
        let destroy_failed = |cause: String| {
            KmsError::provider_error_at(
                "destroy key",
                &cause,
                error_codes::PROVIDER_KEY_DESTROY_FAILED,
                BACKEND,
                &self.endpoint.to_string(),
            )
        };

        let session = self.session()?;
        let handles = session
            .find_objects(&[Attribute::Id(id)])
            .map_err(|e| destroy_failed(format!("object lookup failed: {}", e)))?;
        for handle in &handles {
            session
                .destroy_object(*handle)
                .map_err(|e| destroy_failed(format!("failed to destroy object: {}", e)))?;
        }

        log::debug!(
            "Destroyed {} token objects of key {} on APQN {}",
            handles.len(),
            reference.id,
            self.endpoint
        );
        Ok(())
    }

    fn close(&mut self) -> KmsResult<()> {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.logout() {
                log::debug!("Logout from APQN {} failed: {}", self.endpoint, e);
            }
            drop(session);
        }
        if let Some(context) = self.context.take() {
            context.finalize();
        }
        log::debug!("Closed PKCS#11 session for APQN {}", self.endpoint);
        Ok(())
    }
}

impl Drop for Pkcs11Provider {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close PKCS#11 provider: {}", e);
        }
    }
}

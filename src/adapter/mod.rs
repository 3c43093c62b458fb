/*!
 * Crypto Adapter Directory
 *
 * Identifies crypto adapter endpoints (APQNs), classifies them by adapter
 * family, and reports their availability and master key state.
 */

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{error_codes, KmsError, KmsResult};

pub mod sysfs;

#[cfg(test)]
mod tests;

pub use sysfs::SysfsAdapterDirectory;

/// A crypto adapter endpoint, addressed by card (unit) and domain (subunit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    /// Adapter (card) number
    pub unit: u8,
    /// Usage domain number
    pub subunit: u16,
}

impl Endpoint {
    pub fn new(unit: u8, subunit: u16) -> Self {
        Self { unit, subunit }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}.{:04x}", self.unit, self.subunit)
    }
}

impl FromStr for Endpoint {
    type Err = KmsError;

    /// Parses `card.domain` with both numbers in hex, e.g. `3.12` or `03.0012`
    fn from_str(s: &str) -> KmsResult<Self> {
        let invalid = |reason: &str| {
            KmsError::invalid_adapter(s, reason, error_codes::UNKNOWN_ADAPTER)
        };

        let (card, domain) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| invalid("expected the format 'card.domain'"))?;

        let unit = u8::from_str_radix(card, 16)
            .map_err(|_| invalid("card number must be a hex value up to ff"))?;
        let subunit = u16::from_str_radix(domain, 16)
            .map_err(|_| invalid("domain number must be a hex value up to ffff"))?;

        Ok(Self { unit, subunit })
    }
}

impl TryFrom<String> for Endpoint {
    type Error = KmsError;

    fn try_from(value: String) -> KmsResult<Self> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// Render a list of endpoints the way they are shown in messages
pub fn format_endpoints(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(Endpoint::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Adapter families the plugin can work with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterFamily {
    /// CCA coprocessor (data-centric)
    #[serde(rename = "CCA")]
    Cca,
    /// EP11 coprocessor (token-centric)
    #[serde(rename = "EP11")]
    Ep11,
}

impl AdapterFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterFamily::Cca => "CCA",
            AdapterFamily::Ep11 => "EP11",
        }
    }

    /// Key types that can be stored with adapters of this family
    pub fn key_types(&self) -> &'static [&'static str] {
        match self {
            AdapterFamily::Cca => &[KEY_TYPE_CCA_AESDATA, KEY_TYPE_CCA_AESCIPHER],
            AdapterFamily::Ep11 => &[KEY_TYPE_EP11_AES],
        }
    }
}

impl fmt::Display for AdapterFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterFamily {
    type Err = KmsError;

    fn from_str(s: &str) -> KmsResult<Self> {
        if s.eq_ignore_ascii_case("CCA") {
            Ok(AdapterFamily::Cca)
        } else if s.eq_ignore_ascii_case("EP11") {
            Ok(AdapterFamily::Ep11)
        } else {
            Err(KmsError::invalid_request(
                "adapter-family",
                &format!("unknown adapter family '{}'", s),
            ))
        }
    }
}

pub const KEY_TYPE_CCA_AESDATA: &str = "CCA-AESDATA";
pub const KEY_TYPE_CCA_AESCIPHER: &str = "CCA-AESCIPHER";
pub const KEY_TYPE_EP11_AES: &str = "EP11-AES";

/// State of a master key register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterState {
    Empty,
    Partial,
    Full,
    Valid,
    Invalid,
}

/// One master key register with its verification pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterKeyRegister {
    pub state: RegisterState,
    pub mkvp: u64,
}

impl MasterKeyRegister {
    pub fn empty() -> Self {
        Self {
            state: RegisterState::Empty,
            mkvp: 0,
        }
    }

    pub fn valid(mkvp: u64) -> Self {
        Self {
            state: RegisterState::Valid,
            mkvp,
        }
    }
}

/// Asymmetric (APKA) master key registers of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterKeyState {
    pub current: MasterKeyRegister,
    pub new: MasterKeyRegister,
}

/// Source of adapter information
///
/// Results are never cached beyond a single validation pass.
pub trait AdapterDirectory {
    /// Family of the adapter behind `endpoint`, or `None` if unknown or unsupported
    fn adapter_family(&self, endpoint: Endpoint) -> Option<AdapterFamily>;

    /// Whether `endpoint` is online and of the given family
    fn is_online(&self, endpoint: Endpoint, family: AdapterFamily) -> bool;

    /// APKA master key registers of `endpoint`
    fn master_key_state(&self, endpoint: Endpoint) -> KmsResult<MasterKeyState>;
}

/// Entry of a [`StaticAdapterDirectory`]
#[derive(Debug, Clone)]
pub struct StaticAdapter {
    pub family: AdapterFamily,
    pub online: bool,
    pub master_key: MasterKeyState,
}

/// Adapter directory backed by an in-memory table
///
/// Useful for hosts that enumerate adapters on their own.
#[derive(Debug, Clone, Default)]
pub struct StaticAdapterDirectory {
    adapters: BTreeMap<Endpoint, StaticAdapter>,
}

impl StaticAdapterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an online endpoint with a valid current master key
    pub fn with_adapter(mut self, endpoint: Endpoint, family: AdapterFamily, mkvp: u64) -> Self {
        self.insert(
            endpoint,
            StaticAdapter {
                family,
                online: true,
                master_key: MasterKeyState {
                    current: MasterKeyRegister::valid(mkvp),
                    new: MasterKeyRegister::empty(),
                },
            },
        );
        self
    }

    pub fn insert(&mut self, endpoint: Endpoint, adapter: StaticAdapter) {
        self.adapters.insert(endpoint, adapter);
    }

    pub fn set_online(&mut self, endpoint: Endpoint, online: bool) {
        if let Some(adapter) = self.adapters.get_mut(&endpoint) {
            adapter.online = online;
        }
    }
}

impl AdapterDirectory for StaticAdapterDirectory {
    fn adapter_family(&self, endpoint: Endpoint) -> Option<AdapterFamily> {
        self.adapters.get(&endpoint).map(|a| a.family)
    }

    fn is_online(&self, endpoint: Endpoint, family: AdapterFamily) -> bool {
        self.adapters
            .get(&endpoint)
            .map(|a| a.online && a.family == family)
            .unwrap_or(false)
    }

    fn master_key_state(&self, endpoint: Endpoint) -> KmsResult<MasterKeyState> {
        self.adapters
            .get(&endpoint)
            .map(|a| a.master_key)
            .ok_or_else(|| {
                KmsError::invalid_adapter(
                    &endpoint.to_string(),
                    "not found",
                    error_codes::UNKNOWN_ADAPTER,
                )
            })
    }
}

/// Classify and check a set of endpoints for configuration
///
/// The first endpoint determines the family. Every endpoint must be known,
/// of that family, and online. Returns the family.
pub fn validate_endpoints(
    directory: &dyn AdapterDirectory,
    endpoints: &[Endpoint],
) -> KmsResult<AdapterFamily> {
    let first = endpoints
        .first()
        .ok_or_else(|| KmsError::invalid_request("apqns", "at least one APQN is required"))?;

    let family = directory.adapter_family(*first).ok_or_else(|| {
        KmsError::invalid_adapter(
            &first.to_string(),
            "the adapter is not available or not a supported type",
            error_codes::UNKNOWN_ADAPTER,
        )
    })?;

    for endpoint in endpoints {
        match directory.adapter_family(*endpoint) {
            None => {
                return Err(KmsError::invalid_adapter(
                    &endpoint.to_string(),
                    "the adapter is not available or not a supported type",
                    error_codes::UNKNOWN_ADAPTER,
                ))
            }
            Some(other) if other != family => {
                return Err(KmsError::invalid_adapter(
                    &endpoint.to_string(),
                    &format!("APQN is of type {}, but {} is expected", other, family),
                    error_codes::ADAPTER_FAMILY_MISMATCH,
                ))
            }
            Some(_) => {}
        }

        if !directory.is_online(*endpoint, family) {
            return Err(KmsError::invalid_adapter(
                &endpoint.to_string(),
                "the APQN is not online",
                error_codes::ADAPTER_OFFLINE,
            ));
        }
    }

    Ok(family)
}

/// Verify that the APKA master key setup of CCA endpoints is consistent
///
/// All current registers must be valid and hold the same key, and all
/// fully loaded new registers must hold the same key.
pub fn cross_check_master_keys(
    directory: &dyn AdapterDirectory,
    endpoints: &[Endpoint],
) -> KmsResult<()> {
    let mut current_mkvp: Option<u64> = None;
    let mut new_mkvp: Option<u64> = None;

    for endpoint in endpoints {
        let state = directory.master_key_state(*endpoint)?;

        if state.current.state != RegisterState::Valid {
            return Err(KmsError::inconsistent_adapter_setup(&format!(
                "APQN {} does not have a valid current APKA master key",
                endpoint
            )));
        }

        match current_mkvp {
            Some(mkvp) if mkvp != state.current.mkvp => {
                return Err(KmsError::inconsistent_adapter_setup(&format!(
                    "APQN {} has current APKA master key {:016x}, expected {:016x}",
                    endpoint, state.current.mkvp, mkvp
                )));
            }
            Some(_) => {}
            None => current_mkvp = Some(state.current.mkvp),
        }

        if state.new.state == RegisterState::Full {
            match new_mkvp {
                Some(mkvp) if mkvp != state.new.mkvp => {
                    return Err(KmsError::inconsistent_adapter_setup(&format!(
                        "APQN {} has a different new APKA master key",
                        endpoint
                    )));
                }
                Some(_) => {}
                None => new_mkvp = Some(state.new.mkvp),
            }
        }
    }

    Ok(())
}

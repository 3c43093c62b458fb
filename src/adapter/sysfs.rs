//! Adapter directory reading the AP bus device tree in sysfs.

use std::fs;
use std::path::{Path, PathBuf};

use super::{
    AdapterDirectory, AdapterFamily, Endpoint, MasterKeyRegister, MasterKeyState, RegisterState,
};
use crate::error::{error_codes, KmsError, KmsResult};

/// Default location of the AP bus devices
pub const DEFAULT_AP_DEVICES: &str = "/sys/devices/ap";

/// Adapter directory reading `card*/type`, `online` and `mkvps` attributes
#[derive(Debug, Clone)]
pub struct SysfsAdapterDirectory {
    root: PathBuf,
}

impl Default for SysfsAdapterDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_AP_DEVICES)
    }
}

impl SysfsAdapterDirectory {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn card_dir(&self, endpoint: Endpoint) -> PathBuf {
        self.root.join(format!("card{:02x}", endpoint.unit))
    }

    fn queue_dir(&self, endpoint: Endpoint) -> PathBuf {
        self.card_dir(endpoint).join(endpoint.to_string())
    }

    fn read_attribute(path: &Path) -> Option<String> {
        fs::read_to_string(path).ok().map(|s| s.trim().to_string())
    }
}

/// Family from a card type string such as `CEX7C` or `CEX8P`
fn family_from_card_type(card_type: &str) -> Option<AdapterFamily> {
    if !card_type.starts_with("CEX") {
        return None;
    }
    match card_type.chars().last() {
        Some('C') => Some(AdapterFamily::Cca),
        Some('P') => Some(AdapterFamily::Ep11),
        _ => None,
    }
}

fn parse_register(line: &str) -> Option<MasterKeyRegister> {
    // "valid 0x1234567890abcdef"
    let mut parts = line.split_whitespace();
    let state = match parts.next()? {
        "empty" => RegisterState::Empty,
        "partial" => RegisterState::Partial,
        "full" => RegisterState::Full,
        "valid" => RegisterState::Valid,
        "invalid" => RegisterState::Invalid,
        _ => return None,
    };
    let mkvp = parts
        .next()
        .map(|v| v.trim_start_matches("0x"))
        .and_then(|v| u64::from_str_radix(v, 16).ok())
        .unwrap_or(0);

    Some(MasterKeyRegister { state, mkvp })
}

/// Parse the APKA registers out of the `mkvps` attribute
pub(crate) fn parse_apka_mkvps(contents: &str) -> Option<MasterKeyState> {
    let mut current = None;
    let mut new = None;

    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("APKA CUR:") {
            current = parse_register(rest.trim());
        } else if let Some(rest) = line.strip_prefix("APKA NEW:") {
            new = parse_register(rest.trim());
        }
    }

    Some(MasterKeyState {
        current: current?,
        new: new.unwrap_or_else(MasterKeyRegister::empty),
    })
}

impl AdapterDirectory for SysfsAdapterDirectory {
    fn adapter_family(&self, endpoint: Endpoint) -> Option<AdapterFamily> {
        if !self.queue_dir(endpoint).is_dir() {
            return None;
        }
        Self::read_attribute(&self.card_dir(endpoint).join("type"))
            .as_deref()
            .and_then(family_from_card_type)
    }

    fn is_online(&self, endpoint: Endpoint, family: AdapterFamily) -> bool {
        if self.adapter_family(endpoint) != Some(family) {
            return false;
        }
        let card_online = Self::read_attribute(&self.card_dir(endpoint).join("online"))
            .map(|v| v == "1")
            .unwrap_or(false);
        let queue_online = Self::read_attribute(&self.queue_dir(endpoint).join("online"))
            .map(|v| v == "1")
            .unwrap_or(false);

        card_online && queue_online
    }

    fn master_key_state(&self, endpoint: Endpoint) -> KmsResult<MasterKeyState> {
        let path = self.queue_dir(endpoint).join("mkvps");
        let contents = fs::read_to_string(&path).map_err(|e| {
            KmsError::invalid_adapter(
                &endpoint.to_string(),
                &format!("failed to read {}: {}", path.display(), e),
                error_codes::UNKNOWN_ADAPTER,
            )
        })?;

        parse_apka_mkvps(&contents).ok_or_else(|| {
            KmsError::inconsistent_adapter_setup(&format!(
                "APQN {} does not report an APKA master key",
                endpoint
            ))
        })
    }
}

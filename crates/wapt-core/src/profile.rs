//! Access point profiles: what the operator asks for, validated before any
//! host state is touched.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WaptError};
use crate::mac::MacAddr;

pub const CHANNELS_2GHZ: std::ops::RangeInclusive<u8> = 1..=14;
pub const CHANNELS_5GHZ: &[u8] = &[
    36, 40, 44, 48, 52, 56, 60, 64, 100, 104, 108, 112, 116, 120, 124, 128, 132, 136, 140, 144,
    149, 153, 157, 161, 165,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityMode {
    #[default]
    None,
    Wpa2,
    #[serde(alias = "wpa1", alias = "wpa")]
    Wpa1Legacy,
    #[serde(alias = "wpa3", alias = "sae")]
    Wpa3Sae,
}

impl SecurityMode {
    pub fn label(&self) -> &'static str {
        match self {
            SecurityMode::None => "none",
            SecurityMode::Wpa2 => "wpa2",
            SecurityMode::Wpa1Legacy => "wpa1-legacy",
            SecurityMode::Wpa3Sae => "wpa3-sae",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, SecurityMode::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSpec {
    pub ssid: String,
    #[serde(default, alias = "bssid", alias = "bssidOverride")]
    pub bssid_override: Option<MacAddr>,
    pub channel: u8,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, alias = "security", alias = "securityMode")]
    pub security_mode: SecurityMode,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl ProfileSpec {
    pub fn open(ssid: impl Into<String>, channel: u8) -> Self {
        Self {
            ssid: ssid.into(),
            bssid_override: None,
            channel,
            hidden: false,
            security_mode: SecurityMode::None,
            passphrase: None,
        }
    }

    /// `g` for 2.4 GHz channels, `a` for 5 GHz.
    pub fn hw_mode(&self) -> &'static str {
        if CHANNELS_2GHZ.contains(&self.channel) {
            "g"
        } else {
            "a"
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ssid.is_empty() {
            return Err(WaptError::Validation("ssid is empty".into()));
        }
        if self.ssid.len() > 32 {
            return Err(WaptError::Validation(format!(
                "ssid '{}' is {} bytes, the limit is 32",
                self.ssid,
                self.ssid.len()
            )));
        }
        if self.ssid.chars().any(char::is_control) {
            return Err(WaptError::Validation(
                "ssid contains control characters".into(),
            ));
        }
        if !CHANNELS_2GHZ.contains(&self.channel) && !CHANNELS_5GHZ.contains(&self.channel) {
            return Err(WaptError::Validation(format!(
                "channel {} is not a supported 2.4 or 5 GHz channel",
                self.channel
            )));
        }
        if let Some(bssid) = self.bssid_override {
            validate_bssid(bssid)?;
        }

        let passphrase = self.passphrase.as_deref().unwrap_or("");
        match self.security_mode {
            SecurityMode::None => {}
            SecurityMode::Wpa2 | SecurityMode::Wpa1Legacy => {
                let len = passphrase.chars().count();
                if !(8..=63).contains(&len) {
                    return Err(WaptError::Validation(format!(
                        "{} passphrase must be 8 to 63 characters, got {len}",
                        self.security_mode.label()
                    )));
                }
            }
            SecurityMode::Wpa3Sae => {
                if passphrase.is_empty() {
                    return Err(WaptError::Validation(
                        "wpa3-sae requires a passphrase".into(),
                    ));
                }
            }
        }
        if passphrase.contains('\n') || passphrase.contains('\r') {
            return Err(WaptError::Validation(
                "passphrase contains a line break".into(),
            ));
        }
        Ok(())
    }
}

/// An advertised BSSID must be a non-zero unicast address.
pub fn validate_bssid(bssid: MacAddr) -> Result<()> {
    if bssid.is_multicast() || bssid.is_zero() {
        return Err(WaptError::Validation(format!(
            "bssid override {bssid} is not a unicast address"
        )));
    }
    Ok(())
}

pub fn profiles_dir(root: &Path) -> PathBuf {
    root.join("profiles")
}

/// Lowercases and collapses separators so a display name maps to one file.
pub fn sanitize_profile_name(input: &str) -> String {
    let mut sanitized = String::new();
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            sanitized.push(ch.to_ascii_lowercase());
        } else if (ch.is_whitespace() || ch == '-' || ch == '_') && !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }
    let trimmed = sanitized.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "profile".to_string()
    } else {
        trimmed
    }
}

/// File backing `name`: the exact `<name>.json` when that file exists and
/// the name is a bare stem, else the sanitized form.
pub fn profile_path(dir: &Path, name: &str) -> PathBuf {
    let bare = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(|c| c == '/' || c == '\\');
    if bare {
        let exact = dir.join(format!("{name}.json"));
        if exact.is_file() {
            return exact;
        }
    }
    dir.join(format!("{}.json", sanitize_profile_name(name)))
}

/// Loads and validates the profile `name` from `dir`. A missing or
/// malformed profile is a validation failure, never an IO error.
pub fn load_profile(dir: &Path, name: &str) -> Result<ProfileSpec> {
    read_profile(&profile_path(dir, name), name)
}

fn read_profile(file: &Path, name: &str) -> Result<ProfileSpec> {
    let raw = match fs::read_to_string(&file) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(WaptError::Validation(format!(
                "profile '{name}' not found at {}",
                file.display()
            )));
        }
        Err(err) => return Err(WaptError::io(format!("reading {}", file.display()), err)),
    };

    let profile: ProfileSpec = serde_json::from_str(&raw).map_err(|e| {
        WaptError::Validation(format!("profile '{name}' is malformed: {e}"))
    })?;
    profile.validate()?;

    if profile.security_mode.is_open() && profile.passphrase.is_some() {
        warn!(profile = name, "open profile carries a passphrase; ignoring it");
    }
    info!(profile = name, ssid = %profile.ssid, channel = profile.channel, "loaded profile");
    Ok(profile)
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileSummary {
    pub name: String,
    pub ssid: String,
    pub channel: u8,
    pub security: SecurityMode,
    pub hidden: bool,
}

/// Lists every valid profile, sorted by name. Broken files are skipped with
/// a warning so one bad profile does not hide the rest.
pub fn list_profiles(dir: &Path) -> Result<Vec<ProfileSummary>> {
    let mut profiles = Vec::new();
    if !dir.exists() {
        info!("profiles directory does not exist yet: {}", dir.display());
        return Ok(profiles);
    }

    let entries = fs::read_dir(dir)
        .map_err(|e| WaptError::io(format!("reading {}", dir.display()), e))?;
    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(err) => {
                warn!("error reading profiles directory entry: {err}");
                continue;
            }
        };
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        match read_profile(&path, name) {
            Ok(spec) => profiles.push(ProfileSummary {
                name: name.to_string(),
                ssid: spec.ssid,
                channel: spec.channel,
                security: spec.security_mode,
                hidden: spec.hidden,
            }),
            Err(err) => warn!(file = %path.display(), "skipping profile: {err}"),
        }
    }

    profiles.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(profiles)
}

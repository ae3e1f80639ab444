//! Renders the AP daemon configuration from a line template.
//!
//! Placeholders are `{name}`. Lines carrying a security directive are
//! dropped entirely for open networks, and any line whose value comes out
//! empty is dropped too: hostapd refuses to start on `wpa_passphrase=`.

use std::fs;
use std::path::Path;

use crate::error::{Result, WaptError};
use crate::mac::MacAddr;
use crate::profile::{ProfileSpec, SecurityMode};

pub const DEFAULT_TEMPLATE: &str = "\
interface={interface}
driver={driver}
ssid={ssid}
hw_mode={hw_mode}
channel={channel}
ieee80211n=1
wmm_enabled=1
macaddr_acl=0
auth_algs=1
ignore_broadcast_ssid={ignore_broadcast_ssid}
wpa={wpa}
wpa_key_mgmt={wpa_key_mgmt}
wpa_pairwise={wpa_pairwise}
rsn_pairwise={rsn_pairwise}
wpa_passphrase={passphrase}
sae_password={sae_password}
ieee80211w={ieee80211w}
";

/// Directive keys that only make sense on a secured network.
pub const SECURITY_DIRECTIVES: &[&str] = &[
    "wpa",
    "wpa_key_mgmt",
    "wpa_pairwise",
    "rsn_pairwise",
    "wpa_passphrase",
    "wpa_psk",
    "sae_password",
    "sae_require_mfp",
    "ieee80211w",
];

/// Reads `<dir>/hostapd.conf` when an operator template exists, else the
/// built-in one.
pub fn load_template(dir: &Path) -> Result<String> {
    let path = dir.join("hostapd.conf");
    match fs::read_to_string(&path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(DEFAULT_TEMPLATE.to_string()),
        Err(err) => Err(WaptError::io(format!("reading {}", path.display()), err)),
    }
}

struct SecurityValues {
    wpa: &'static str,
    key_mgmt: &'static str,
    wpa_pairwise: &'static str,
    rsn_pairwise: &'static str,
    ieee80211w: &'static str,
    sae: bool,
}

fn security_values(mode: SecurityMode) -> Option<SecurityValues> {
    match mode {
        SecurityMode::None => None,
        SecurityMode::Wpa2 => Some(SecurityValues {
            wpa: "2",
            key_mgmt: "WPA-PSK",
            wpa_pairwise: "",
            rsn_pairwise: "CCMP",
            ieee80211w: "",
            sae: false,
        }),
        SecurityMode::Wpa1Legacy => Some(SecurityValues {
            wpa: "1",
            key_mgmt: "WPA-PSK",
            wpa_pairwise: "TKIP",
            rsn_pairwise: "",
            ieee80211w: "",
            sae: false,
        }),
        SecurityMode::Wpa3Sae => Some(SecurityValues {
            wpa: "2",
            key_mgmt: "SAE",
            wpa_pairwise: "",
            rsn_pairwise: "CCMP",
            ieee80211w: "2",
            sae: true,
        }),
    }
}

fn directive_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    trimmed.split_once('=').map(|(key, _)| key.trim())
}

/// Substitutes profile values into `template` for `interface`.
pub fn render(template: &str, profile: &ProfileSpec, interface: &str, driver: &str) -> String {
    let security = security_values(profile.security_mode);
    let passphrase = profile.passphrase.as_deref().unwrap_or("");
    let channel = profile.channel.to_string();

    let (wpa, key_mgmt, wpa_pairwise, rsn_pairwise, ieee80211w, psk, sae_password) = match &security
    {
        Some(s) if s.sae => (s.wpa, s.key_mgmt, s.wpa_pairwise, s.rsn_pairwise, s.ieee80211w, "", passphrase),
        Some(s) => (s.wpa, s.key_mgmt, s.wpa_pairwise, s.rsn_pairwise, s.ieee80211w, passphrase, ""),
        None => ("", "", "", "", "", "", ""),
    };

    let substitutions: [(&str, &str); 13] = [
        ("interface", interface),
        ("driver", driver),
        ("ssid", &profile.ssid),
        ("hw_mode", profile.hw_mode()),
        ("channel", &channel),
        ("ignore_broadcast_ssid", if profile.hidden { "1" } else { "0" }),
        ("wpa", wpa),
        ("wpa_key_mgmt", key_mgmt),
        ("wpa_pairwise", wpa_pairwise),
        ("rsn_pairwise", rsn_pairwise),
        ("passphrase", psk),
        ("sae_password", sae_password),
        ("ieee80211w", ieee80211w),
    ];

    let mut out = String::with_capacity(template.len());
    for line in template.lines() {
        if security.is_none() {
            if let Some(key) = directive_key(line) {
                if SECURITY_DIRECTIVES.contains(&key) {
                    continue;
                }
            }
        }

        let rendered = substitute(line, &substitutions);

        if directive_key(&rendered).is_some()
            && rendered.trim_end().ends_with('=')
            && line.contains('{')
        {
            continue;
        }
        out.push_str(&rendered);
        out.push('\n');
    }
    out
}

/// One left-to-right pass. Substituted values are copied verbatim and never
/// rescanned; unknown `{...}` text is kept as written.
fn substitute(line: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let known = after.find('}').and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value, close))
        });
        match known {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Appends the resolved BSSID so the daemon advertises it.
pub fn append_bssid(config: &mut String, bssid: MacAddr) {
    if !config.is_empty() && !config.ends_with('\n') {
        config.push('\n');
    }
    config.push_str(&format!("bssid={bssid}\n"));
}

/// Security directive keys present in a rendered config.
pub fn security_directives(config: &str) -> Vec<&str> {
    config
        .lines()
        .filter_map(directive_key)
        .filter(|key| SECURITY_DIRECTIVES.contains(key))
        .collect()
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    MacOs,
    Linux,
}

impl OsFamily {
    /// Value for the `sec-ch-ua-platform` client hint
    pub fn client_hint(&self) -> &'static str {
        match self {
            OsFamily::Windows => "\"Windows\"",
            OsFamily::MacOs => "\"macOS\"",
            OsFamily::Linux => "\"Linux\"",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    Chrome,
    Edge,
    Firefox,
    Safari,
}

impl BrowserFamily {
    /// Chromium browsers send client hints, Gecko and WebKit do not
    pub fn sends_client_hints(&self) -> bool {
        matches!(self, BrowserFamily::Chrome | BrowserFamily::Edge)
    }
}

/// How header names are written on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderCasing {
    Lower,
    Title,
}

impl HeaderCasing {
    pub fn apply(&self, name: &str) -> String {
        match self {
            HeaderCasing::Lower => name.to_ascii_lowercase(),
            HeaderCasing::Title => name
                .split('-')
                .map(|part| {
                    let mut chars = part.chars();
                    match chars.next() {
                        Some(first) => {
                            first.to_ascii_uppercase().to_string()
                                + &chars.as_str().to_ascii_lowercase()
                        }
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join("-"),
        }
    }
}

/// Browser identity bound to a session. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintProfile {
    /// Name of the device template the profile was drawn from
    pub template: String,
    /// Seed the profile was generated from
    pub seed: u64,
    pub os: OsFamily,
    pub browser: BrowserFamily,
    pub user_agent: String,
    pub platform: String,
    pub accept_language: String,
    pub timezone: String,
    pub header_order: Vec<String>,
    pub header_casing: HeaderCasing,
    pub screen: (u16, u16),
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub canvas_noise_seed: u64,
    pub webgl_noise_seed: u64,
    pub webrtc_disabled: bool,
}

impl FingerprintProfile {
    /// Header names in template order, cased the way the browser sends them
    pub fn ordered_headers(&self) -> Vec<String> {
        self.header_order
            .iter()
            .map(|name| self.header_casing.apply(name))
            .collect()
    }
}

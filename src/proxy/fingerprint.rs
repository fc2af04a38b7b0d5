//! Browser fingerprint generation
//!
//! Profiles are drawn from a closed set of named device templates. Every
//! field that must agree with the others (user agent, platform, header order,
//! header casing, WebGL pair) comes from the same template; only the values
//! that real devices of one family vary on (screen, GPU, noise seeds) are
//! sampled inside it.

use parking_lot::Mutex;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;

use crate::models::{BrowserFamily, FingerprintProfile, HeaderCasing, OsFamily};

const CHROMIUM_HEADERS: &[&str] = &[
    "host",
    "connection",
    "sec-ch-ua",
    "sec-ch-ua-mobile",
    "sec-ch-ua-platform",
    "upgrade-insecure-requests",
    "user-agent",
    "accept",
    "sec-fetch-site",
    "sec-fetch-mode",
    "sec-fetch-user",
    "sec-fetch-dest",
    "accept-encoding",
    "accept-language",
];

const FIREFOX_HEADERS: &[&str] = &[
    "host",
    "user-agent",
    "accept",
    "accept-language",
    "accept-encoding",
    "connection",
    "upgrade-insecure-requests",
    "sec-fetch-dest",
    "sec-fetch-mode",
    "sec-fetch-site",
    "sec-fetch-user",
];

const SAFARI_HEADERS: &[&str] = &[
    "host",
    "accept",
    "sec-fetch-site",
    "sec-fetch-dest",
    "accept-language",
    "sec-fetch-mode",
    "user-agent",
    "accept-encoding",
    "connection",
];

const DESKTOP_SCREENS: &[(u16, u16)] = &[(1920, 1080), (2560, 1440), (1366, 768), (1536, 864)];
const MAC_SCREENS: &[(u16, u16)] = &[(1440, 900), (1512, 982), (1728, 1117), (2560, 1440)];

const WINDOWS_GPUS: &[(&str, &str)] = &[
    (
        "Google Inc. (NVIDIA)",
        "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    (
        "Google Inc. (AMD)",
        "ANGLE (AMD, AMD Radeon RX 6700 XT Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    (
        "Google Inc. (Intel)",
        "ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
];

const MAC_GPUS: &[(&str, &str)] = &[
    ("Apple Inc.", "Apple M1"),
    ("Apple Inc.", "Apple M2"),
    ("Apple Inc.", "Apple M3 Pro"),
];

const LINUX_GPUS: &[(&str, &str)] = &[
    ("Mozilla", "Mesa Intel(R) UHD Graphics 620 (KBL GT2)"),
    ("Mozilla", "AMD Radeon RX 580 (polaris10, LLVM 15.0.7, DRM 3.49)"),
];

/// One internally consistent device family
#[derive(Debug)]
struct DeviceTemplate {
    name: &'static str,
    weight: f64,
    os: OsFamily,
    browser: BrowserFamily,
    user_agent: &'static str,
    platform: &'static str,
    header_order: &'static [&'static str],
    header_casing: HeaderCasing,
    screens: &'static [(u16, u16)],
    gpus: &'static [(&'static str, &'static str)],
    timezones: &'static [&'static str],
    accept_language: &'static str,
    webrtc_disable_rate: f64,
}

const TEMPLATES: &[DeviceTemplate] = &[
    DeviceTemplate {
        name: "windows-chrome",
        weight: 0.35,
        os: OsFamily::Windows,
        browser: BrowserFamily::Chrome,
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        platform: "Win32",
        header_order: CHROMIUM_HEADERS,
        header_casing: HeaderCasing::Lower,
        screens: DESKTOP_SCREENS,
        gpus: WINDOWS_GPUS,
        timezones: &["America/New_York", "America/Chicago", "America/Los_Angeles"],
        accept_language: "en-US,en;q=0.9",
        webrtc_disable_rate: 0.7,
    },
    DeviceTemplate {
        name: "windows-edge",
        weight: 0.12,
        os: OsFamily::Windows,
        browser: BrowserFamily::Edge,
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
        platform: "Win32",
        header_order: CHROMIUM_HEADERS,
        header_casing: HeaderCasing::Lower,
        screens: DESKTOP_SCREENS,
        gpus: WINDOWS_GPUS,
        timezones: &["America/New_York", "America/Chicago"],
        accept_language: "en-US,en;q=0.9",
        webrtc_disable_rate: 0.7,
    },
    DeviceTemplate {
        name: "windows-firefox",
        weight: 0.08,
        os: OsFamily::Windows,
        browser: BrowserFamily::Firefox,
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
        platform: "Win32",
        header_order: FIREFOX_HEADERS,
        header_casing: HeaderCasing::Title,
        screens: DESKTOP_SCREENS,
        gpus: WINDOWS_GPUS,
        timezones: &["America/New_York", "America/Denver"],
        accept_language: "en-US,en;q=0.5",
        webrtc_disable_rate: 0.9,
    },
    DeviceTemplate {
        name: "macos-chrome",
        weight: 0.15,
        os: OsFamily::MacOs,
        browser: BrowserFamily::Chrome,
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        platform: "MacIntel",
        header_order: CHROMIUM_HEADERS,
        header_casing: HeaderCasing::Lower,
        screens: MAC_SCREENS,
        gpus: MAC_GPUS,
        timezones: &["America/Los_Angeles", "America/New_York"],
        accept_language: "en-US,en;q=0.9",
        webrtc_disable_rate: 0.7,
    },
    DeviceTemplate {
        name: "macos-safari",
        weight: 0.12,
        os: OsFamily::MacOs,
        browser: BrowserFamily::Safari,
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
        platform: "MacIntel",
        header_order: SAFARI_HEADERS,
        header_casing: HeaderCasing::Title,
        screens: MAC_SCREENS,
        gpus: MAC_GPUS,
        timezones: &["America/Los_Angeles", "America/New_York"],
        accept_language: "en-US,en;q=0.9",
        webrtc_disable_rate: 0.5,
    },
    DeviceTemplate {
        name: "linux-chrome",
        weight: 0.1,
        os: OsFamily::Linux,
        browser: BrowserFamily::Chrome,
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        platform: "Linux x86_64",
        header_order: CHROMIUM_HEADERS,
        header_casing: HeaderCasing::Lower,
        screens: DESKTOP_SCREENS,
        gpus: LINUX_GPUS,
        timezones: &["Europe/London", "America/New_York"],
        accept_language: "en-US,en;q=0.9",
        webrtc_disable_rate: 0.8,
    },
    DeviceTemplate {
        name: "linux-firefox",
        weight: 0.08,
        os: OsFamily::Linux,
        browser: BrowserFamily::Firefox,
        user_agent: "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:133.0) Gecko/20100101 Firefox/133.0",
        platform: "Linux x86_64",
        header_order: FIREFOX_HEADERS,
        header_casing: HeaderCasing::Title,
        screens: DESKTOP_SCREENS,
        gpus: LINUX_GPUS,
        timezones: &["Europe/London", "Europe/Berlin"],
        accept_language: "en-US,en;q=0.5",
        webrtc_disable_rate: 0.9,
    },
];

/// Timezones and language preference for a country code
fn locale_for(geo: &str) -> Option<(&'static [&'static str], &'static str)> {
    let locale: (&'static [&'static str], &'static str) = match geo {
        "US" => (
            &[
                "America/New_York",
                "America/Chicago",
                "America/Denver",
                "America/Los_Angeles",
            ],
            "en-US,en;q=0.9",
        ),
        "CA" => (&["America/Toronto", "America/Vancouver"], "en-CA,en;q=0.9,fr-CA;q=0.8"),
        "GB" | "UK" => (&["Europe/London"], "en-GB,en;q=0.9"),
        "IE" => (&["Europe/Dublin"], "en-IE,en;q=0.9"),
        "DE" => (&["Europe/Berlin"], "de-DE,de;q=0.9,en;q=0.8"),
        "FR" => (&["Europe/Paris"], "fr-FR,fr;q=0.9,en;q=0.8"),
        "NL" => (&["Europe/Amsterdam"], "nl-NL,nl;q=0.9,en;q=0.8"),
        "ES" => (&["Europe/Madrid"], "es-ES,es;q=0.9,en;q=0.8"),
        "IT" => (&["Europe/Rome"], "it-IT,it;q=0.9,en;q=0.8"),
        "PL" => (&["Europe/Warsaw"], "pl-PL,pl;q=0.9,en;q=0.8"),
        "BR" => (&["America/Sao_Paulo"], "pt-BR,pt;q=0.9,en;q=0.8"),
        "MX" => (&["America/Mexico_City"], "es-MX,es;q=0.9,en;q=0.8"),
        "JP" => (&["Asia/Tokyo"], "ja-JP,ja;q=0.9,en;q=0.8"),
        "SG" => (&["Asia/Singapore"], "en-SG,en;q=0.9"),
        "IN" => (&["Asia/Kolkata"], "en-IN,en;q=0.9,hi;q=0.8"),
        "AU" => (&["Australia/Sydney", "Australia/Melbourne"], "en-AU,en;q=0.9"),
        _ => return None,
    };
    Some(locale)
}

/// Draws fingerprint profiles
#[derive(Debug)]
pub struct FingerprintGenerator {
    seeds: Mutex<StdRng>,
}

impl FingerprintGenerator {
    /// Create a generator; a fixed seed makes the sequence of profiles reproducible
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            seeds: Mutex::new(rng),
        }
    }

    /// Draw a fresh profile, matched to `geo` when it is a known country code
    pub fn generate(&self, geo: Option<&str>) -> FingerprintProfile {
        let seed = self.seeds.lock().gen::<u64>();
        Self::generate_with_seed(seed, geo)
    }

    /// Pure function of `seed` and `geo`
    pub fn generate_with_seed(seed: u64, geo: Option<&str>) -> FingerprintProfile {
        let mut rng = StdRng::seed_from_u64(seed);
        let template = pick_template(&mut rng);

        let locale = geo.and_then(|g| locale_for(&g.trim().to_ascii_uppercase()));
        let (timezones, accept_language) = match locale {
            Some((zones, language)) => (zones, language),
            None => (template.timezones, template.accept_language),
        };

        let timezone = timezones
            .choose(&mut rng)
            .copied()
            .unwrap_or("America/New_York");
        let screen = template
            .screens
            .choose(&mut rng)
            .copied()
            .unwrap_or((1920, 1080));
        let (webgl_vendor, webgl_renderer) = template
            .gpus
            .choose(&mut rng)
            .copied()
            .unwrap_or(("Google Inc.", "ANGLE (Intel, Intel(R) UHD Graphics 630)"));

        FingerprintProfile {
            template: template.name.to_string(),
            seed,
            os: template.os,
            browser: template.browser,
            user_agent: template.user_agent.to_string(),
            platform: template.platform.to_string(),
            accept_language: accept_language.to_string(),
            timezone: timezone.to_string(),
            header_order: template.header_order.iter().map(|h| h.to_string()).collect(),
            header_casing: template.header_casing,
            screen,
            webgl_vendor: webgl_vendor.to_string(),
            webgl_renderer: webgl_renderer.to_string(),
            canvas_noise_seed: rng.gen(),
            webgl_noise_seed: rng.gen(),
            webrtc_disabled: rng.gen_bool(template.webrtc_disable_rate),
        }
    }

    /// Names of the device templates profiles are drawn from
    pub fn template_names() -> impl Iterator<Item = &'static str> {
        TEMPLATES.iter().map(|t| t.name)
    }
}

impl Default for FingerprintGenerator {
    fn default() -> Self {
        Self::new(None)
    }
}

fn pick_template(rng: &mut StdRng) -> &'static DeviceTemplate {
    match WeightedIndex::new(TEMPLATES.iter().map(|t| t.weight)) {
        Ok(dist) => &TEMPLATES[dist.sample(rng)],
        Err(_) => &TEMPLATES[0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_profile() {
        let a = FingerprintGenerator::generate_with_seed(1234, Some("DE"));
        let b = FingerprintGenerator::generate_with_seed(1234, Some("DE"));
        assert_eq!(a, b);

        let c = FingerprintGenerator::generate_with_seed(1235, Some("DE"));
        assert_ne!(a.canvas_noise_seed, c.canvas_noise_seed);
    }

    #[test]
    fn test_seeded_generator_is_reproducible() {
        let first = FingerprintGenerator::new(Some(9));
        let second = FingerprintGenerator::new(Some(9));
        for _ in 0..5 {
            assert_eq!(first.generate(None), second.generate(None));
        }
    }

    #[test]
    fn test_profiles_are_internally_consistent() {
        for seed in 0..500 {
            let fp = FingerprintGenerator::generate_with_seed(seed, None);

            match fp.os {
                OsFamily::Windows => {
                    assert!(fp.user_agent.contains("Windows"));
                    assert_eq!(fp.platform, "Win32");
                }
                OsFamily::MacOs => {
                    assert!(fp.user_agent.contains("Macintosh"));
                    assert_eq!(fp.platform, "MacIntel");
                    assert!(fp.webgl_vendor.starts_with("Apple"));
                }
                OsFamily::Linux => {
                    assert!(fp.user_agent.contains("Linux"));
                    assert!(fp.platform.starts_with("Linux"));
                }
            }

            let hints = fp.header_order.iter().any(|h| h.starts_with("sec-ch-ua"));
            assert_eq!(hints, fp.browser.sends_client_hints());
            match fp.browser {
                BrowserFamily::Chrome | BrowserFamily::Edge => {
                    assert_eq!(fp.header_casing, HeaderCasing::Lower)
                }
                BrowserFamily::Firefox | BrowserFamily::Safari => {
                    assert_eq!(fp.header_casing, HeaderCasing::Title)
                }
            }
            assert!(fp.user_agent.contains("Firefox") == (fp.browser == BrowserFamily::Firefox));
        }
    }

    #[test]
    fn test_timezone_follows_geo() {
        for seed in 0..50 {
            let fp = FingerprintGenerator::generate_with_seed(seed, Some("jp"));
            assert_eq!(fp.timezone, "Asia/Tokyo");
            assert!(fp.accept_language.starts_with("ja-JP"));

            let us = FingerprintGenerator::generate_with_seed(seed, Some("US"));
            assert!(us.timezone.starts_with("America/"));
        }

        // Unknown codes fall back to the template's own locale
        let fp = FingerprintGenerator::generate_with_seed(3, Some("ZZ"));
        assert!(!fp.timezone.is_empty());
    }

    #[test]
    fn test_every_template_is_reachable() {
        let mut seen = std::collections::HashSet::new();
        for seed in 0..2000 {
            seen.insert(FingerprintGenerator::generate_with_seed(seed, None).template);
        }
        for name in FingerprintGenerator::template_names() {
            assert!(seen.contains(name), "template {} never drawn", name);
        }
    }

    #[test]
    fn test_ordered_headers_use_template_casing() {
        let fp = (0..100)
            .map(|seed| FingerprintGenerator::generate_with_seed(seed, None))
            .find(|fp| fp.browser == BrowserFamily::Firefox)
            .unwrap();
        let headers = fp.ordered_headers();
        assert_eq!(headers[0], "Host");
        assert_eq!(headers[1], "User-Agent");
    }
}

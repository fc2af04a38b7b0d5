//! Proxy list ingestion
//!
//! Accepts a JSON array, or an object with a `proxies` array. Each entry is
//! either a proxy URL string or an object:
//!
//! ```json
//! [
//!   "socks5://10.0.0.1:1080",
//!   { "proxy": "http://10.0.1.1:3128", "geo": "US" },
//!   { "ip": "10.0.2.1", "port": "8080", "protocol": "https",
//!     "location": { "countryCode": "DE" }, "base_score": 0.8 }
//! ]
//! ```
//!
//! Entries that cannot be understood are skipped with a warning.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, RotaError};
use crate::models::{ProxyEndpoint, ProxyProtocol};

/// Where proxy candidates come from
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>>;

    fn name(&self) -> &str;
}

/// Proxy list kept in a JSON file on disk
#[derive(Debug, Clone)]
pub struct FileProxySource {
    path: PathBuf,
}

impl FileProxySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProxySource for FileProxySource {
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>> {
        load_proxy_file(&self.path).await
    }

    fn name(&self) -> &str {
        "file"
    }
}

pub async fn load_proxy_file(path: impl AsRef<Path>) -> Result<Vec<ProxyEndpoint>> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path).await?;
    let endpoints = parse_proxy_list(&raw)?;
    debug!(path = %path.display(), count = endpoints.len(), "Proxy list loaded");
    Ok(endpoints)
}

pub fn parse_proxy_list(json: &str) -> Result<Vec<ProxyEndpoint>> {
    let entries = match serde_json::from_str::<Value>(json)? {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("proxies") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(RotaError::InvalidConfig(
                    "proxy list object has no `proxies` array".to_string(),
                ))
            }
        },
        _ => {
            return Err(RotaError::InvalidConfig(
                "proxy list must be a JSON array or object".to_string(),
            ))
        }
    };

    let mut endpoints = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match parse_entry(entry) {
            Ok(endpoint) => endpoints.push(endpoint),
            Err(e) => warn!(index, error = %e, "Skipping proxy entry"),
        }
    }
    Ok(endpoints)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(u16),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
struct Location {
    #[serde(rename = "countryCode", alias = "country_code")]
    country_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProxyEntry {
    #[serde(alias = "url")]
    proxy: Option<String>,
    #[serde(alias = "ip")]
    host: Option<String>,
    port: Option<PortField>,
    #[serde(alias = "scheme", alias = "type")]
    protocol: Option<String>,
    #[serde(alias = "country")]
    geo: Option<String>,
    location: Option<Location>,
    #[serde(alias = "score")]
    base_score: Option<f64>,
}

fn parse_entry(entry: Value) -> Result<ProxyEndpoint> {
    let entry = match entry {
        Value::String(url) => return ProxyEndpoint::parse(&url),
        Value::Object(_) => serde_json::from_value::<ProxyEntry>(entry)?,
        other => return Err(RotaError::InvalidProxyAddress(other.to_string())),
    };

    let mut endpoint = match (&entry.proxy, &entry.host) {
        (Some(url), _) => ProxyEndpoint::parse(url)?,
        (None, Some(host)) => {
            let protocol = match entry.protocol.as_deref() {
                Some(raw) => ProxyProtocol::from_str(raw)
                    .ok_or_else(|| RotaError::UnsupportedProtocol(raw.to_string()))?,
                None => ProxyProtocol::Http,
            };
            let port = match &entry.port {
                Some(PortField::Number(port)) => *port,
                Some(PortField::Text(raw)) => raw
                    .trim()
                    .parse()
                    .map_err(|_| RotaError::InvalidProxyAddress(format!("{}:{}", host, raw)))?,
                None => protocol.default_port(),
            };
            if host.trim().is_empty() {
                return Err(RotaError::InvalidProxyAddress("empty host".to_string()));
            }
            ProxyEndpoint::new(host.trim(), port, protocol)
        }
        (None, None) => {
            return Err(RotaError::InvalidProxyAddress(
                "entry has neither `proxy` nor `host`".to_string(),
            ))
        }
    };

    let geo = entry
        .geo
        .or_else(|| entry.location.and_then(|l| l.country_code));
    if let Some(geo) = geo.filter(|g| !g.trim().is_empty()) {
        endpoint = endpoint.with_geo(geo);
    }
    if let Some(score) = entry.base_score {
        endpoint = endpoint.with_base_score(score);
    }
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_entries() {
        let json = r#"[
            "socks5://10.0.0.1:1080",
            "10.0.0.2:8080",
            { "proxy": "http://10.0.1.1:3128", "geo": "us" },
            { "ip": "10.0.2.1", "port": "8080", "protocol": "https",
              "location": { "countryCode": "DE" }, "base_score": 0.8 },
            { "host": "proxy.example.com", "port": 9000 }
        ]"#;

        let endpoints = parse_proxy_list(json).unwrap();
        assert_eq!(endpoints.len(), 5);

        assert_eq!(endpoints[0].protocol, ProxyProtocol::Socks5);
        assert_eq!(endpoints[1].protocol, ProxyProtocol::Http);
        assert_eq!(endpoints[2].geo.as_deref(), Some("US"));

        let third = &endpoints[3];
        assert_eq!(third.host, "10.0.2.1");
        assert_eq!(third.port, 8080);
        assert_eq!(third.protocol, ProxyProtocol::Https);
        assert_eq!(third.geo.as_deref(), Some("DE"));
        assert_eq!(third.base_score, Some(0.8));

        assert_eq!(endpoints[4].port, 9000);
    }

    #[test]
    fn test_parse_wrapped_list_skips_bad_entries() {
        let json = r#"{ "proxies": [
            "http://10.0.0.1:80",
            42,
            { "ip": "10.0.0.3", "port": "not-a-port" },
            { "ip": "10.0.0.4", "port": 80, "protocol": "ftp" },
            { "geo": "US" }
        ] }"#;

        let endpoints = parse_proxy_list(json).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].host, "10.0.0.1");
    }

    #[test]
    fn test_parse_rejects_wrong_shapes() {
        assert!(matches!(
            parse_proxy_list(r#"{ "items": [] }"#),
            Err(RotaError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_proxy_list("\"just a string\""),
            Err(RotaError::InvalidConfig(_))
        ));
        assert!(matches!(parse_proxy_list("not json"), Err(RotaError::Json(_))));
    }

    #[tokio::test]
    async fn test_file_source() {
        let path = std::env::temp_dir().join(format!("proxies-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, r#"["http://10.9.0.1:8080"]"#)
            .await
            .unwrap();

        let source = FileProxySource::new(&path);
        let endpoints = source.fetch().await.unwrap();
        assert_eq!(source.name(), "file");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].port, 8080);

        tokio::fs::remove_file(&path).await.unwrap();
        assert!(matches!(source.fetch().await, Err(RotaError::Io(_))));
    }
}

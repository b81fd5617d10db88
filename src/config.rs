//! Runtime configuration read from environment variables.

use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use axum::http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
const DEFAULT_EVENT_LOG_PATH: &str = "data/events.jsonl";
const DEFAULT_MAX_AGE_SECONDS: u64 = 3600;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_FFMPEG_TIMEOUT_SECONDS: u64 = 600;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub download_dir: PathBuf,
    pub event_log_path: PathBuf,
    pub artifact_max_age: Duration,
    /// Never coarser than `artifact_max_age`.
    pub sweep_interval: Duration,
    pub max_concurrent_downloads: usize,
    pub yt_dlp_bin: PathBuf,
    pub yt_dlp_timeout: Duration,
    pub ffmpeg_bin: PathBuf,
    pub ffmpeg_timeout: Duration,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |name: &str| lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string));

        let artifact_max_age = match read("ARTIFACT_MAX_AGE_SECONDS") {
            Some(value) => match value.parse::<u64>() {
                Ok(seconds) if seconds > 0 => Duration::from_secs(seconds),
                _ => {
                    return Err(Error::Config(format!(
                        "ARTIFACT_MAX_AGE_SECONDS invalido: {value}. Usa un numero de segundos mayor que 0."
                    )));
                }
            },
            None => Duration::from_secs(DEFAULT_MAX_AGE_SECONDS),
        };

        let sweep_interval = match read("SWEEP_INTERVAL_SECONDS").and_then(|value| value.parse::<u64>().ok()) {
            Some(seconds) if seconds > 0 && Duration::from_secs(seconds) <= artifact_max_age => {
                Duration::from_secs(seconds)
            }
            Some(seconds) if seconds > 0 => {
                warn!(
                    "SWEEP_INTERVAL_SECONDS={seconds} supera la retencion de {}s; se usara la retencion.",
                    artifact_max_age.as_secs()
                );
                artifact_max_age
            }
            _ => artifact_max_age,
        };

        let allowed_origins = read("ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr: resolve_bind_addr(read("APP_ADDR"), read("PORT")),
            download_dir: read("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
            event_log_path: read("EVENT_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EVENT_LOG_PATH)),
            artifact_max_age,
            sweep_interval,
            max_concurrent_downloads: read("MAX_CONCURRENT_DOWNLOADS")
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            yt_dlp_bin: read("YT_DLP_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("yt-dlp")),
            yt_dlp_timeout: read("YT_DLP_TIMEOUT_SECONDS")
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS)),
            ffmpeg_bin: read("FFMPEG_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            ffmpeg_timeout: read("FFMPEG_TIMEOUT_SECONDS")
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(DEFAULT_FFMPEG_TIMEOUT_SECONDS)),
            trust_proxy_headers: read("TRUST_PROXY_HEADERS")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(false),
            allowed_origins,
        })
    }

    pub fn cors_layer(&self) -> Result<CorsLayer> {
        let base = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers([
                CONTENT_DISPOSITION,
                HeaderName::from_static("x-download-filename"),
            ]);

        if self.allowed_origins.is_empty() {
            warn!("ALLOWED_ORIGINS no esta configurado. Se aceptaran peticiones de cualquier origen.");
            return Ok(base.allow_origin(Any));
        }

        let normalized_origins = self
            .allowed_origins
            .iter()
            .map(|origin| {
                normalize_origin(origin).ok_or_else(|| {
                    Error::Config(format!(
                        "Origen invalido en ALLOWED_ORIGINS: {origin}. Usa valores tipo https://dominio.com"
                    ))
                })
            })
            .collect::<Result<HashSet<_>>>()?;
        info!(
            "CORS allow-list cargada con {} origen(es): {:?}",
            normalized_origins.len(),
            normalized_origins
        );

        let allowed_origins = Arc::new(normalized_origins);
        let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        });

        Ok(base.allow_origin(allow_origin))
    }
}

fn resolve_bind_addr(app_addr: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = app_addr {
        return configured;
    }

    if let Some(port) = port.and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_with(&[]).unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:5000");
        assert_eq!(config.download_dir, PathBuf::from("downloads"));
        assert_eq!(config.artifact_max_age, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, config.artifact_max_age);
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.ffmpeg_timeout, Duration::from_secs(600));
        assert!(!config.trust_proxy_headers);
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn sweep_interval_is_clamped_to_retention() {
        let finer = config_with(&[
            ("ARTIFACT_MAX_AGE_SECONDS", "600"),
            ("SWEEP_INTERVAL_SECONDS", "60"),
        ])
        .unwrap();
        assert_eq!(finer.sweep_interval, Duration::from_secs(60));

        let coarser = config_with(&[
            ("ARTIFACT_MAX_AGE_SECONDS", "600"),
            ("SWEEP_INTERVAL_SECONDS", "7200"),
        ])
        .unwrap();
        assert_eq!(coarser.sweep_interval, Duration::from_secs(600));
    }

    #[test]
    fn tool_timeouts_are_configurable() {
        let config = config_with(&[
            ("YT_DLP_TIMEOUT_SECONDS", "120"),
            ("FFMPEG_TIMEOUT_SECONDS", "90"),
        ])
        .unwrap();
        assert_eq!(config.yt_dlp_timeout, Duration::from_secs(120));
        assert_eq!(config.ffmpeg_timeout, Duration::from_secs(90));

        let fallback = config_with(&[("FFMPEG_TIMEOUT_SECONDS", "0")]).unwrap();
        assert_eq!(fallback.ffmpeg_timeout, Duration::from_secs(600));
    }

    #[test]
    fn zero_retention_is_rejected() {
        let error = config_with(&[("ARTIFACT_MAX_AGE_SECONDS", "0")]).unwrap_err();
        assert!(matches!(error, Error::Config(_)));
    }

    #[test]
    fn bind_addr_prefers_app_addr_then_port() {
        let config = config_with(&[("APP_ADDR", "0.0.0.0:9000"), ("PORT", "8080")]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");

        let config = config_with(&[("PORT", "8080")]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn parses_bool_flags_and_origin_lists() {
        let config = config_with(&[
            ("TRUST_PROXY_HEADERS", "yes"),
            ("ALLOWED_ORIGINS", " https://a.example , ,http://localhost:5173"),
        ])
        .unwrap();

        assert!(config.trust_proxy_headers);
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example", "http://localhost:5173"]
        );
        assert!(config.cors_layer().is_ok());
    }

    #[test]
    fn invalid_origin_is_a_config_error() {
        let config = config_with(&[("ALLOWED_ORIGINS", "ftp://files.example")]).unwrap();
        assert!(matches!(config.cors_layer(), Err(Error::Config(_))));
    }

    #[test]
    fn normalizes_origins() {
        assert_eq!(
            normalize_origin("HTTPS://Example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5173").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(normalize_origin("https://example.com/path"), None);
    }
}

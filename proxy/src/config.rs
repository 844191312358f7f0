//! Process-wide configuration
//!
//! Loaded once at startup from the environment and published behind an [`arc_swap::ArcSwap`]
//! snapshot pointer so every in-flight request binds one consistent view for its lifetime.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Feature flags recognized from client configuration. All gate transformer
/// invocation or header/body rewriting; none affect connection-level behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFlags {
    pub transform_js: bool,
    pub transform_css: bool,
    pub transform_html: bool,
    pub bundle_es_modules: bool,
    pub emulate_service_workers: bool,
    pub remove_ads: bool,
    pub remove_tracking: bool,
    pub inject_polyfills: bool,
    pub spoof_user_agent: bool,
    pub spoof_user_agent_in_js: bool,
    pub cache_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            transform_js: true,
            transform_css: true,
            transform_html: true,
            bundle_es_modules: true,
            emulate_service_workers: true,
            remove_ads: true,
            remove_tracking: true,
            inject_polyfills: true,
            spoof_user_agent: true,
            spoof_user_agent_in_js: true,
            cache_enabled: true,
        }
    }
}

impl FeatureFlags {
    /// Load from the environment, falling back to `defaults` for anything unset. Each flag is
    /// `REVAMP_<UPPER_SNAKE_FIELD_NAME>`, e.g. `REVAMP_TRANSFORM_JS`, `REVAMP_CACHE_ENABLED`.
    fn from_env(defaults: &FeatureFlags) -> Self {
        Self {
            transform_js: env_bool("REVAMP_TRANSFORM_JS", defaults.transform_js),
            transform_css: env_bool("REVAMP_TRANSFORM_CSS", defaults.transform_css),
            transform_html: env_bool("REVAMP_TRANSFORM_HTML", defaults.transform_html),
            bundle_es_modules: env_bool("REVAMP_BUNDLE_ES_MODULES", defaults.bundle_es_modules),
            emulate_service_workers: env_bool(
                "REVAMP_EMULATE_SERVICE_WORKERS",
                defaults.emulate_service_workers,
            ),
            remove_ads: env_bool("REVAMP_REMOVE_ADS", defaults.remove_ads),
            remove_tracking: env_bool("REVAMP_REMOVE_TRACKING", defaults.remove_tracking),
            inject_polyfills: env_bool("REVAMP_INJECT_POLYFILLS", defaults.inject_polyfills),
            spoof_user_agent: env_bool("REVAMP_SPOOF_USER_AGENT", defaults.spoof_user_agent),
            spoof_user_agent_in_js: env_bool(
                "REVAMP_SPOOF_USER_AGENT_IN_JS",
                defaults.spoof_user_agent_in_js,
            ),
            cache_enabled: env_bool("REVAMP_CACHE_ENABLED", defaults.cache_enabled),
        }
    }

    /// Bitset used as one component of the cache fingerprint. Order is
    /// fixed so the same flag combination always produces the same bits.
    pub fn active_bitset(&self) -> u16 {
        let bits = [
            self.transform_js,
            self.transform_css,
            self.transform_html,
            self.bundle_es_modules,
            self.emulate_service_workers,
            self.remove_ads,
            self.remove_tracking,
            self.inject_polyfills,
            self.spoof_user_agent,
            self.spoof_user_agent_in_js,
            self.cache_enabled,
        ];
        bits.iter()
            .enumerate()
            .fold(0u16, |acc, (i, set)| if *set { acc | (1 << i) } else { acc })
    }
}

/// Process-wide configuration snapshot.
#[derive(Debug, Clone)]
pub struct RevampConfig {
    pub socks5_port: u16,
    pub http_proxy_port: u16,
    pub portal_port: u16,
    pub cert_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub flags: FeatureFlags,
    pub target_browsers: Vec<String>,
    pub compression_level: u32,
    pub allow_self_signed_origins: bool,
}

impl Default for RevampConfig {
    fn default() -> Self {
        Self {
            socks5_port: 1080,
            http_proxy_port: 8080,
            portal_port: 8888,
            cert_dir: PathBuf::from("./data/certs"),
            cache_dir: PathBuf::from("./data/cache"),
            flags: FeatureFlags::default(),
            target_browsers: vec!["ios 9".to_string(), "ios 11".to_string()],
            compression_level: 4,
            allow_self_signed_origins: false,
        }
    }
}

impl RevampConfig {
    /// Load configuration from the environment, falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            socks5_port: env_u16("REVAMP_SOCKS5_PORT", defaults.socks5_port),
            http_proxy_port: env_u16("REVAMP_HTTP_PROXY_PORT", defaults.http_proxy_port),
            portal_port: env_u16("REVAMP_PORTAL_PORT", defaults.portal_port),
            cert_dir: env_path("REVAMP_CERT_DIR", defaults.cert_dir),
            cache_dir: env_path("REVAMP_CACHE_DIR", defaults.cache_dir),
            flags: FeatureFlags::from_env(&defaults.flags),
            target_browsers: env_string_list("REVAMP_TARGET_BROWSERS", defaults.target_browsers),
            compression_level: env_u32("REVAMP_COMPRESSION_LEVEL", defaults.compression_level)
                .clamp(1, 9),
            allow_self_signed_origins: env_bool(
                "REVAMP_ALLOW_SELF_SIGNED_ORIGINS",
                defaults.allow_self_signed_origins,
            ),
        }
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

/// Comma-separated list, e.g. `REVAMP_TARGET_BROWSERS="ios 9,ios 11,chrome 90"`.
fn env_string_list(key: &str, default: Vec<String>) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .filter(|parsed: &Vec<String>| !parsed.is_empty())
        .unwrap_or(default)
}

/// Shared, hot-swappable configuration handle. Every component holds a clone of this and calls
/// [`ConfigHandle::current`] once per request to bind a single, consistent snapshot.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<RevampConfig>>,
}

impl ConfigHandle {
    pub fn new(config: RevampConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Bind the config snapshot a request will observe for its entire lifetime.
    pub fn current(&self) -> Arc<RevampConfig> {
        self.inner.load_full()
    }

    /// Atomically replace the active configuration (e.g. on a future reload signal).
    pub fn replace(&self, config: RevampConfig) {
        self.inner.store(Arc::new(config));
    }
}

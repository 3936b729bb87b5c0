use serde::Deserialize;
use std::{fs, ops::RangeInclusive, path::PathBuf, time::Duration};
use tracing::debug;
use crate::error::{Error, Result};

pub const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const USAGE_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const INSTANCE_ADD_PACING: Duration = Duration::from_millis(50);
pub const CONTAINER_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TAIL_LINES: i64 = 100;

/// Values as they may appear in the TOML file; every field optional.
#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    pub apps_domain: Option<String>,
    pub storage_class: Option<String>,
    pub runtime_class: Option<String>,
    pub listen_addr: Option<String>,
    pub node_port_min: Option<u16>,
    pub node_port_max: Option<u16>,
    pub registry_host: Option<String>,
    pub registry_signing_key: Option<String>,
    pub registry_token_ttl_secs: Option<u64>,
    pub prometheus_url: Option<String>,
    pub extra_allow_cidrs: Option<Vec<String>>,
    pub log_level: Option<String>,
    pub log_json: Option<bool>,
    pub store_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub apps_domain: String,
    pub storage_class: String,
    pub runtime_class: Option<String>,
    pub listen_addr: String,
    pub node_port_range: RangeInclusive<u16>,
    pub registry_host: Option<String>,
    pub registry_signing_key: String,
    pub registry_token_ttl: Duration,
    pub prometheus_url: Option<String>,
    pub extra_allow_cidrs: Vec<String>,
    pub log_level: String,
    pub log_json: bool,
    pub store_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            apps_domain: "apps.localhost".into(),
            storage_class: "ceph-rbd".into(),
            runtime_class: None,
            listen_addr: "0.0.0.0:3000".into(),
            node_port_range: 30030..=32767,
            registry_host: None,
            registry_signing_key: String::new(),
            registry_token_ttl: Duration::from_secs(3600),
            prometheus_url: None,
            extra_allow_cidrs: vec!["10.0.0.0/8".into(), "172.16.0.0/12".into(), "192.168.0.0/16".into()],
            log_level: "info".into(),
            log_json: false,
            store_file: None,
        }
    }
}

impl Settings {
    /// File named by `APPHOST_CONFIG` (if any), then `APPHOST_*` env overrides.
    pub fn load() -> Result<Self> {
        let file_cfg = match std::env::var("APPHOST_CONFIG") {
            Ok(path) if !path.is_empty() => read_file(&PathBuf::from(path))?,
            _ => FileConfig::default(),
        };
        let mut s = Self::default().merge(file_cfg);
        s.apply_env()?;
        if s.node_port_range.is_empty() { return Err(Error::Config("node port range is empty".into())); }
        Ok(s)
    }

    pub fn merge(mut self, f: FileConfig) -> Self {
        if let Some(v) = f.apps_domain { self.apps_domain = v; }
        if let Some(v) = f.storage_class { self.storage_class = v; }
        if f.runtime_class.is_some() { self.runtime_class = f.runtime_class; }
        if let Some(v) = f.listen_addr { self.listen_addr = v; }
        let (lo, hi) = (f.node_port_min.unwrap_or(*self.node_port_range.start()), f.node_port_max.unwrap_or(*self.node_port_range.end()));
        self.node_port_range = lo..=hi;
        if f.registry_host.is_some() { self.registry_host = f.registry_host; }
        if let Some(v) = f.registry_signing_key { self.registry_signing_key = v; }
        if let Some(v) = f.registry_token_ttl_secs { self.registry_token_ttl = Duration::from_secs(v); }
        if f.prometheus_url.is_some() { self.prometheus_url = f.prometheus_url; }
        if let Some(v) = f.extra_allow_cidrs { self.extra_allow_cidrs = v; }
        if let Some(v) = f.log_level { self.log_level = v; }
        if let Some(v) = f.log_json { self.log_json = v; }
        if f.store_file.is_some() { self.store_file = f.store_file; }
        self
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env("APPHOST_APPS_DOMAIN") { self.apps_domain = v; }
        if let Some(v) = env("APPHOST_STORAGE_CLASS") { self.storage_class = v; }
        if let Some(v) = env("APPHOST_RUNTIME_CLASS") { self.runtime_class = Some(v); }
        if let Some(v) = env("APPHOST_LISTEN_ADDR") { self.listen_addr = v; }
        if let Some(v) = env("APPHOST_REGISTRY_HOST") { self.registry_host = Some(v); }
        if let Some(v) = env("APPHOST_REGISTRY_SIGNING_KEY") { self.registry_signing_key = v; }
        if let Some(v) = env("APPHOST_REGISTRY_TOKEN_TTL_SECS") {
            self.registry_token_ttl = Duration::from_secs(v.parse().map_err(|_| Error::Config(format!("APPHOST_REGISTRY_TOKEN_TTL_SECS: {v}")))?);
        }
        if let Some(v) = env("APPHOST_PROMETHEUS_URL") { self.prometheus_url = Some(v); }
        if let Some(v) = env("APPHOST_EXTRA_ALLOW_CIDRS") {
            self.extra_allow_cidrs = v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
        }
        if let Some(v) = env("APPHOST_LOG_LEVEL") { self.log_level = v; }
        if let Some(v) = env("APPHOST_LOG_JSON") { self.log_json = v == "1" || v.eq_ignore_ascii_case("true"); }
        if let Some(v) = env("APPHOST_STORE_FILE") { self.store_file = Some(PathBuf::from(v)); }
        Ok(())
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn read_file(path: &PathBuf) -> Result<FileConfig> {
    debug!(path=?path, "config.load.attempt");
    let content = fs::read_to_string(path).map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))
}

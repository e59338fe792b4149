//! Configuration loader (spec §6 Environment): locates the base
//! directory, default address prefix pools, default wireless range, and
//! the distributed peer list from a layered key/value configuration,
//! grounded on the `config` crate usage in the pack's storage-engine
//! manifests (layered defaults -> file -> env).

use std::collections::HashMap;
use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfigEntry {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_wireless_range")]
    pub default_wireless_range: f64,
    #[serde(default = "default_ipv4_prefix_len")]
    pub default_ipv4_prefix_len: u8,
    #[serde(default)]
    pub peers: Vec<PeerConfigEntry>,
    /// Arbitrary pass-through keys for `session.setConfig` that the
    /// engine itself does not interpret.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

fn default_base_dir() -> String {
    "/tmp".to_string()
}

fn default_prefix() -> String {
    "emu".to_string()
}

fn default_wireless_range() -> f64 {
    100.0
}

fn default_ipv4_prefix_len() -> u8 {
    24
}

impl EngineConfig {
    /// Base directory for a specific session's private filesystem root,
    /// `<base_dir>/<prefix>.<session_id>/` per spec §6.
    pub fn session_root(&self, session_id: u32) -> PathBuf {
        PathBuf::from(&self.base_dir).join(format!("{}.{}", self.prefix, session_id))
    }
}

/// Load configuration layered as defaults < optional file < `SESSION_`
/// prefixed environment variables, the same precedence order the pack's
/// config-crate users apply.
pub fn load(config_file: Option<&str>) -> Result<EngineConfig, config::ConfigError> {
    let mut builder = Config::builder()
        .set_default("base_dir", default_base_dir())?
        .set_default("prefix", default_prefix())?
        .set_default("default_wireless_range", default_wireless_range())?
        .set_default("default_ipv4_prefix_len", default_ipv4_prefix_len() as i64)?;

    if let Some(path) = config_file {
        builder = builder.add_source(File::with_name(path).required(false));
    }

    builder = builder.add_source(Environment::with_prefix("SESSION").separator("_"));

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_file_or_env() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.prefix, "emu");
        assert_eq!(cfg.default_wireless_range, 100.0);
    }

    #[test]
    fn session_root_matches_configured_pattern() {
        let cfg = load(None).unwrap();
        let root = cfg.session_root(7);
        assert_eq!(root, PathBuf::from("/tmp/emu.7"));
    }
}

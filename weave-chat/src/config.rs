//! Load config from file and environment.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use weave_core::NetworkConfig;

/// Chat node configuration. File: ~/.config/weave/config.toml or /etc/weave/config.toml.
/// Env overrides: WEAVE_LISTEN_ADDR, WEAVE_BOOTSTRAP (comma separated),
/// WEAVE_PEER_CAPACITY, WEAVE_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen address (default 0.0.0.0:3000).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Peers dialed at startup.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Log filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub network: NetworkConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap: Vec::new(),
            log_level: default_log_level(),
            network: NetworkConfig::default(),
        }
    }
}

/// Load config: default, then the first config file found (or `explicit`),
/// then env vars. A file that exists but does not parse is an error.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("WEAVE_LISTEN_ADDR") {
        c.listen_addr = s;
    }
    if let Some(s) = var("WEAVE_BOOTSTRAP") {
        c.bootstrap = s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(s) = var("WEAVE_PEER_CAPACITY") {
        if let Ok(n) = s.parse::<usize>() {
            c.network.peer_capacity = n;
        }
    }
    if let Some(s) = var("WEAVE_LOG") {
        c.log_level = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/weave/config.toml"));
    }
    out.push(PathBuf::from("/etc/weave/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn toml_with_network_section() {
        let c: Config = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:4000"
            bootstrap = ["10.0.0.2:3000"]

            [network]
            peer_capacity = 4
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_addr, "127.0.0.1:4000");
        assert_eq!(c.bootstrap, vec!["10.0.0.2:3000"]);
        assert_eq!(c.network.peer_capacity, 4);
        assert_eq!(c.network.eviction_interval_secs, 10);
        assert_eq!(c.log_level, "info");
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("listen = \"x\"").is_err());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WEAVE_LISTEN_ADDR", "127.0.0.1:9"),
            ("WEAVE_BOOTSTRAP", "a:1, b:2,,"),
            ("WEAVE_PEER_CAPACITY", "not a number"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_addr, "127.0.0.1:9");
        assert_eq!(c.bootstrap, vec!["a:1", "b:2"]);
        assert_eq!(c.network.peer_capacity, 10);
    }
}

//! Configuration file for the binary: the reactor's own sections plus the
//! remotes it syncs with.

use anyhow::{Context, Result};
use reactor_server::Config;
use reactor_sync::RemoteConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Everything in `reactor.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    /// Name remotes know this reactor by (default: drive-reactor).
    #[serde(default = "default_name")]
    pub name: String,
    /// `[storage]`, `[processor]`, `[events]`, `[signing]`, `[http]`.
    #[serde(flatten)]
    pub reactor: Config,
    /// `[[remotes]]`.
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
}

fn default_name() -> String {
    "drive-reactor".to_string()
}

impl CliConfig {
    /// Load and check a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;

        let mut names = HashSet::new();
        for remote in &config.remotes {
            if remote.name == config.name {
                anyhow::bail!("remote {:?} has this reactor's own name", remote.name);
            }
            if !names.insert(remote.name.as_str()) {
                anyhow::bail!("remote {:?} is listed twice", remote.name);
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
impl CliConfig {
    pub(crate) fn parse_for_tests(content: &str) -> Self {
        Self::parse(content).expect("valid test config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactor_sync::ChannelKind;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let config = CliConfig::parse("").unwrap();
        assert_eq!(config.name, "drive-reactor");
        assert!(config.remotes.is_empty());
        assert_eq!(config.reactor.events.debounce_ms, 250);
        assert_eq!(config.reactor.http.bind_address, "0.0.0.0:8080");
    }

    #[test]
    fn reactor_sections_and_remotes() {
        let config = CliConfig::parse(
            r#"
            name = "edge-1"

            [storage]
            path = "/var/lib/drive/edge.db"

            [events]
            debounce_ms = 50

            [[remotes]]
            name = "hub"
            drive_id = "drive-1"
            url = "http://hub:8080"
            channel = "rpc-with-polling-fallback"
            poll_interval_ms = 5000

            [[remotes]]
            name = "archive"
            drive_id = "drive-1"
            url = "http://archive:8080"
            channel = "polling"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "edge-1");
        assert_eq!(config.reactor.storage.path.to_str(), Some("/var/lib/drive/edge.db"));
        assert_eq!(config.reactor.events.debounce_ms, 50);
        assert_eq!(config.remotes.len(), 2);
        assert_eq!(config.remotes[0].channel, ChannelKind::RpcWithPollingFallback);
        assert_eq!(config.remotes[0].poll_interval_ms, 5000);
        assert_eq!(config.remotes[1].poll_interval_ms, 2000);
    }

    #[test]
    fn duplicate_remotes_are_refused() {
        let result = CliConfig::parse(
            r#"
            [[remotes]]
            name = "hub"
            drive_id = "d"
            url = "http://a"

            [[remotes]]
            name = "hub"
            drive_id = "d"
            url = "http://b"
            "#,
        );
        assert!(result.unwrap_err().to_string().contains("listed twice"));
    }

    #[test]
    fn remote_named_like_self_is_refused() {
        let result = CliConfig::parse(
            r#"
            name = "hub"

            [[remotes]]
            name = "hub"
            drive_id = "d"
            url = "http://a"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = CliConfig::load(Path::new("/nonexistent/reactor.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"from-file\"").unwrap();
        let config = CliConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "from-file");
    }
}

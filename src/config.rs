use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::mux::MuxKind;

/// Server configuration, loaded from TOML. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP server listens on.
    pub bind: SocketAddr,
    /// Program started for every session.
    pub command: String,
    pub args: Vec<String>,
    /// `user:pass` required via Basic auth and the socket handshake.
    pub credential: Option<String>,
    /// Let clients type into the terminal.
    pub permit_write: bool,
    /// Append `arg=` values from the handshake to `args`.
    pub permit_arguments: bool,
    /// Export request headers to the child as `HTTP_*` variables.
    pub pass_headers: bool,
    /// Sent verbatim to the client as terminal preferences.
    pub preferences: Option<serde_json::Value>,
    /// Client reconnect hint in seconds.
    pub reconnect: Option<u64>,
    pub buffer_size: usize,
    /// Seconds to wait for the child on close; negative waits forever.
    pub close_timeout: i64,
    /// Concurrent session cap; 0 is unlimited.
    pub max_connections: usize,
    /// Extra origins allowed for WebSocket upgrades when no credential is set.
    pub ws_origins: Vec<String>,
    /// Program (argv) that receives intercepted clipboard payloads on stdin.
    pub clipboard_command: Option<Vec<String>>,
    pub mux: Option<MuxConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            command: "sh".to_string(),
            args: Vec::new(),
            credential: None,
            permit_write: false,
            permit_arguments: false,
            pass_headers: false,
            preferences: None,
            reconnect: None,
            buffer_size: crate::pty::DEFAULT_BUFFER_SIZE,
            close_timeout: crate::pty::DEFAULT_CLOSE_TIMEOUT.as_secs() as i64,
            max_connections: 0,
            ws_origins: Vec::new(),
            clipboard_command: None,
            mux: None,
        }
    }
}

/// `[mux]` section: attach a multiplexer controller to every session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MuxConfig {
    pub kind: MuxKind,
    pub session: String,
    /// Layout polling period; 0 disables polling.
    pub poll_interval_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            kind: MuxKind::Tmux,
            session: "default".to_string(),
            poll_interval_ms: 2000,
        }
    }
}

impl MuxConfig {
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("credential must have the form user:pass")]
    InvalidCredential,

    #[error("buffer_size must be greater than zero")]
    InvalidBufferSize,
}

impl Config {
    /// Load config from a TOML file. Returns `None` if the file doesn't exist.
    ///
    /// Warns if the file is world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(credential) = &self.credential {
            if !credential.contains(':') {
                return Err(ConfigError::InvalidCredential);
            }
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        Ok(())
    }

    /// `None` means wait forever.
    pub fn close_timeout(&self) -> Option<Duration> {
        u64::try_from(self.close_timeout)
            .ok()
            .map(Duration::from_secs)
    }
}

/// `$XDG_CONFIG_HOME/webmux/config.toml`, or the platform equivalent.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("webmux").join("config.toml"))
}

/// Warn if a config file is world-readable; it may hold a credential.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}); \
             it may contain a credential, consider restricting permissions to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.close_timeout(), Some(Duration::from_secs(10)));
        assert!(config.mux.is_none());
        assert!(!config.permit_write);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            bind = "0.0.0.0:9000"
            command = "tmux"
            args = ["attach", "-t", "main"]
            credential = "admin:hunter2"
            permit_write = true
            permit_arguments = true
            reconnect = 10
            buffer_size = 4096
            close_timeout = -1
            max_connections = 4
            ws_origins = ["https://term.example.com"]
            clipboard_command = ["wl-copy"]

            [preferences]
            fontSize = 14

            [mux]
            kind = "psmux"
            session = "main"
            poll_interval_ms = 0
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.args, vec!["attach", "-t", "main"]);
        assert_eq!(config.close_timeout(), None);
        assert_eq!(config.preferences.unwrap()["fontSize"], 14);
        assert_eq!(config.clipboard_command.unwrap(), vec!["wl-copy"]);
        let mux = config.mux.unwrap();
        assert_eq!(mux.kind, MuxKind::Psmux);
        assert_eq!(mux.session, "main");
        assert_eq!(mux.poll_interval(), None);
    }

    #[test]
    fn mux_section_defaults() {
        let config: Config = toml::from_str("[mux]").unwrap();
        let mux = config.mux.unwrap();
        assert_eq!(mux.kind, MuxKind::Tmux);
        assert_eq!(mux.session, "default");
        assert_eq!(mux.poll_interval(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("permit_writes = true").is_err());
    }

    #[test]
    fn credential_must_contain_colon() {
        let config = Config {
            credential: Some("nocolon".into()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCredential)));
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("nope.toml")).unwrap().is_none());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bind = 42").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "command = \"bash\"\npermit_write = true\n").unwrap();
        let config = Config::load(&path).unwrap().unwrap();
        assert_eq!(config.command, "bash");
        assert!(config.permit_write);
    }

    #[test]
    fn default_path_ends_with_crate_dir() {
        if let Some(path) = default_path() {
            assert!(path.ends_with("webmux/config.toml"));
        }
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_modes() {
        assert!(is_world_readable(0o644));
        assert!(is_world_readable(0o755));
        assert!(!is_world_readable(0o600));
        assert!(!is_world_readable(0o700));
    }

    #[cfg(unix)]
    #[test]
    fn check_permissions_does_not_panic() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        check_config_permissions(&path);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        check_config_permissions(&path);
    }
}

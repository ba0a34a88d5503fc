use crate::handler::SessionSettings;
use anyhow::{Context, Result, bail};
use pm2p::DEFAULT_PORT;
use pm2p::protocol::MIN_PROTOCOL_VERSION;
use pm2p_store::BackendKind;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const CONFIG_FILE: &str = "config.json";
pub const STATE_DIR_ENV: &str = "PM2P_STATE_DIR";
const HOME_STATE_DIR: &str = ".local/state/pm2p";

/// Node settings read from `<state_dir>/config.json`. Every field is optional
/// in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the PM listener binds.
    pub listen: String,
    /// Identifier announced by `/connect` when none is given.
    pub identifier: Option<String>,
    pub backend: BackendKind,
    pub idle_timeout_secs: Option<u64>,
    pub min_version: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_PORT}"),
            identifier: None,
            backend: BackendKind::default(),
            idle_timeout_secs: None,
            min_version: MIN_PROTOCOL_VERSION,
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub identifier: Option<String>,
    pub backend: Option<BackendKind>,
    pub idle_timeout_secs: Option<u64>,
}

impl NodeConfig {
    /// Load from disk, or fall back to defaults if there is no file.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&data).context("invalid config.json")?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) -> Result<()> {
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(identifier) = overrides.identifier {
            self.identifier = Some(identifier);
        }
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        if let Some(secs) = overrides.idle_timeout_secs {
            self.idle_timeout_secs = Some(secs);
        }
        self.validate()
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            min_version: self.min_version,
            idle_timeout: self
                .idle_timeout_secs
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(identifier) = &self.identifier {
            validate_identifier(identifier)?;
        }
        if self.min_version < MIN_PROTOCOL_VERSION {
            bail!("min_version must be at least {MIN_PROTOCOL_VERSION}");
        }
        Ok(())
    }
}

/// Where the config file and message store live: `--state-dir` if given,
/// then `$PM2P_STATE_DIR`, then `~/.local/state/pm2p`.
pub fn resolve_state_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    pick_state_dir(
        flag,
        std::env::var_os(STATE_DIR_ENV),
        std::env::var_os("HOME"),
    )
}

fn pick_state_dir(
    flag: Option<PathBuf>,
    env: Option<OsString>,
    home: Option<OsString>,
) -> Result<PathBuf> {
    let from_env = env.filter(|v| !v.is_empty()).map(PathBuf::from);
    let from_home = || home.map(|h| PathBuf::from(h).join(HOME_STATE_DIR));
    flag.or(from_env)
        .or_else(from_home)
        .with_context(|| format!("no state directory: pass --state-dir or set {STATE_DIR_ENV}"))
}

/// Create the state directory if needed, readable by the owner only.
pub fn prepare_state_dir(path: &Path) -> Result<()> {
    if path.exists() && !path.is_dir() {
        bail!("state dir {} is not a directory", path.display());
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create state dir {}", path.display()))?;
    #[cfg(unix)]
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to restrict state dir {}", path.display()))?;
    Ok(())
}

/// An identifier travels inside the ack line, so it must be a single
/// non-empty token.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        bail!("identifier must not be empty");
    }
    if identifier.chars().any(char::is_whitespace) {
        bail!("identifier must not contain whitespace: {identifier:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(dir.path()).unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.listen, "0.0.0.0:1123");
        assert_eq!(config.backend, BackendKind::Log);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"backend": "sqlite", "identifier": "@me"}"#,
        )
        .unwrap();
        let config = NodeConfig::load(dir.path()).unwrap();
        assert_eq!(config.backend, BackendKind::Sqlite);
        assert_eq!(config.identifier.as_deref(), Some("@me"));
        assert_eq!(config.listen, NodeConfig::default().listen);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert!(NodeConfig::load(dir.path()).is_err());

        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"identifier": "two words"}"#).unwrap();
        assert!(NodeConfig::load(dir.path()).is_err());
    }

    #[test]
    fn overrides_win() {
        let mut config = NodeConfig {
            identifier: Some("@file".into()),
            idle_timeout_secs: Some(10),
            ..NodeConfig::default()
        };
        config
            .apply(Overrides {
                listen: Some("127.0.0.1:4000".into()),
                identifier: Some("@cli".into()),
                backend: None,
                idle_timeout_secs: None,
            })
            .unwrap();
        assert_eq!(config.listen, "127.0.0.1:4000");
        assert_eq!(config.identifier.as_deref(), Some("@cli"));
        assert_eq!(config.idle_timeout_secs, Some(10));

        let settings = config.session_settings();
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(10)));
        assert_eq!(settings.min_version, MIN_PROTOCOL_VERSION);
    }

    #[test]
    fn zero_idle_timeout_means_none() {
        let config = NodeConfig {
            idle_timeout_secs: Some(0),
            ..NodeConfig::default()
        };
        assert_eq!(config.session_settings().idle_timeout, None);
    }

    #[test]
    fn state_dir_flag_beats_env_and_home() {
        let picked = pick_state_dir(
            Some("/srv/pm2p".into()),
            Some("/env/pm2p".into()),
            Some("/home/u".into()),
        )
        .unwrap();
        assert_eq!(picked, PathBuf::from("/srv/pm2p"));

        let home = Some(OsString::from("/home/u"));
        let picked = pick_state_dir(None, Some("/env/pm2p".into()), home.clone()).unwrap();
        assert_eq!(picked, PathBuf::from("/env/pm2p"));

        // An empty variable counts as unset.
        let picked = pick_state_dir(None, Some("".into()), home).unwrap();
        assert_eq!(picked, PathBuf::from("/home/u/.local/state/pm2p"));

        assert!(pick_state_dir(None, None, None).is_err());
    }

    #[test]
    fn prepared_state_dir_holds_config_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("node/state");
        prepare_state_dir(&state).unwrap();
        prepare_state_dir(&state).unwrap();
        #[cfg(unix)]
        {
            let mode = std::fs::metadata(&state).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        std::fs::write(state.join(CONFIG_FILE), r#"{"backend": "sqlite"}"#).unwrap();
        let config = NodeConfig::load(&state).unwrap();
        assert!(config.backend.open(&state).is_ok());
        assert!(state.join("pm2p.db").exists());
    }

    #[test]
    fn state_dir_must_not_be_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("taken");
        std::fs::write(&file, "").unwrap();
        assert!(prepare_state_dir(&file).is_err());
    }

    #[test]
    fn identifier_rules() {
        assert!(validate_identifier("@alice").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a b").is_err());
    }
}

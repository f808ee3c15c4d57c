//! Application configuration
//!
//! Precedence, highest first: command-line flags, config file, environment
//! variables, built-in defaults. Validation rejects configs without an
//! address, a user, or any usable auth method.

use pvedash_api::ConnectionOptions;
use pvedash_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "PVEDASH_";

/// Dashboard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base address, e.g. `https://pve.example.com:8006`
    pub addr: String,

    /// API user name without the realm
    pub user: String,

    /// Authentication realm
    pub realm: String,

    /// Password for ticket auth
    pub password: Option<String>,

    /// API token id for token auth
    pub token_id: Option<String>,

    /// API token secret
    pub token_secret: Option<String>,

    /// Skip TLS certificate verification
    pub insecure: bool,

    /// User for SSH shells
    pub ssh_user: String,

    /// Directory for the response cache and the log file
    pub cache_dir: PathBuf,

    /// Verbose request logging
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: String::new(),
            user: String::new(),
            realm: "pam".to_string(),
            password: None,
            token_id: None,
            token_secret: None,
            insecure: false,
            ssh_user: "root".to_string(),
            cache_dir: pvedash_common::default_cache_dir(),
            debug: false,
        }
    }
}

/// Flag-level overrides, applied last
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub addr: Option<String>,
    pub user: Option<String>,
    pub realm: Option<String>,
    pub password: Option<String>,
    pub token_id: Option<String>,
    pub token_secret: Option<String>,
    pub insecure: Option<bool>,
    pub ssh_user: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub debug: Option<bool>,
}

impl Config {
    /// Defaults, then environment, then the config file, then flags.
    pub fn resolve(file: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        if let Some(path) = file {
            config.merge_file(path)?;
        }
        config.apply_overrides(overrides);
        Ok(config)
    }

    fn apply_env(&mut self) {
        let var = |name: &str| -> Option<String> {
            std::env::var(format!("{ENV_PREFIX}{name}"))
                .ok()
                .filter(|v| !v.is_empty())
        };
        if let Some(v) = var("ADDR") {
            self.addr = v;
        }
        if let Some(v) = var("USER") {
            self.user = v;
        }
        if let Some(v) = var("REALM") {
            self.realm = v;
        }
        if let Some(v) = var("PASSWORD") {
            self.password = Some(v);
        }
        if let Some(v) = var("TOKEN_ID") {
            self.token_id = Some(v);
        }
        if let Some(v) = var("TOKEN_SECRET") {
            self.token_secret = Some(v);
        }
        if let Some(v) = var("INSECURE") {
            self.insecure = v == "1" || v == "true";
        }
        if let Some(v) = var("SSH_USER") {
            self.ssh_user = v;
        }
        if let Some(v) = var("CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let file: Config = toml::from_str(&content)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        let defaults = Config::default();

        if file.addr != defaults.addr {
            self.addr = file.addr;
        }
        if file.user != defaults.user {
            self.user = file.user;
        }
        if file.realm != defaults.realm {
            self.realm = file.realm;
        }
        if file.password.is_some() {
            self.password = file.password;
        }
        if file.token_id.is_some() {
            self.token_id = file.token_id;
        }
        if file.token_secret.is_some() {
            self.token_secret = file.token_secret;
        }
        if file.insecure != defaults.insecure {
            self.insecure = file.insecure;
        }
        if file.ssh_user != defaults.ssh_user {
            self.ssh_user = file.ssh_user;
        }
        if file.cache_dir != defaults.cache_dir {
            self.cache_dir = file.cache_dir;
        }
        if file.debug != defaults.debug {
            self.debug = file.debug;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(v) = &o.addr {
            self.addr = v.clone();
        }
        if let Some(v) = &o.user {
            self.user = v.clone();
        }
        if let Some(v) = &o.realm {
            self.realm = v.clone();
        }
        if let Some(v) = &o.password {
            self.password = Some(v.clone());
        }
        if let Some(v) = &o.token_id {
            self.token_id = Some(v.clone());
        }
        if let Some(v) = &o.token_secret {
            self.token_secret = Some(v.clone());
        }
        if let Some(v) = o.insecure {
            self.insecure = v;
        }
        if let Some(v) = &o.ssh_user {
            self.ssh_user = v.clone();
        }
        if let Some(v) = &o.cache_dir {
            self.cache_dir = v.clone();
        }
        if let Some(v) = o.debug {
            self.debug = v;
        }
    }

    pub fn is_using_token_auth(&self) -> bool {
        self.token_id.as_deref().is_some_and(|t| !t.is_empty())
            && self.token_secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Reject configs that cannot possibly connect.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.addr.is_empty() {
            missing.push("addr");
        }
        if self.user.is_empty() {
            missing.push("user");
        }
        let has_password = self.password.as_deref().is_some_and(|p| !p.is_empty());
        if !has_password && !self.is_using_token_auth() {
            missing.push("password or token_id/token_secret");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!(
                "missing {}",
                missing.join(", ")
            )))
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            addr: self.addr.clone(),
            user: self.user.clone(),
            realm: self.realm.clone(),
            password: self.password.clone(),
            token_id: self.token_id.clone(),
            token_secret: self.token_secret.clone(),
            insecure: self.insecure,
        }
    }
}

/// Default config file location, if it exists.
pub fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    let path = PathBuf::from(home)
        .join(".config")
        .join("pvedash")
        .join("config.toml");
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_overrides() -> Overrides {
        Overrides {
            addr: Some("https://flag:8006".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn flags_beat_file_beats_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "addr = \"https://file:8006\"\nuser = \"fileuser\"\nrealm = \"pve\""
        )
        .unwrap();

        let config = Config::resolve(Some(&path), &base_overrides()).unwrap();
        assert_eq!(config.addr, "https://flag:8006");
        assert_eq!(config.user, "fileuser");
        assert_eq!(config.realm, "pve");
        assert_eq!(config.ssh_user, "root");
    }

    #[test]
    fn validation_requires_addr_user_and_auth() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config {
            addr: "https://pve:8006".to_string(),
            user: "root".to_string(),
            password: Some("pw".to_string()),
            ..Default::default()
        };
        config.validate().unwrap();

        let config = Config {
            addr: "https://pve:8006".to_string(),
            user: "root".to_string(),
            token_id: Some("t".to_string()),
            token_secret: Some("s".to_string()),
            ..Default::default()
        };
        config.validate().unwrap();
        assert!(config.is_using_token_auth());
    }

    #[test]
    fn empty_token_fields_do_not_count_as_token_auth() {
        let config = Config {
            addr: "https://pve:8006".to_string(),
            user: "root".to_string(),
            token_id: Some(String::new()),
            token_secret: Some("s".to_string()),
            ..Default::default()
        };
        assert!(!config.is_using_token_auth());
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_errors_are_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "addr = [not toml").unwrap();
        assert!(matches!(
            Config::resolve(Some(&path), &Overrides::default()),
            Err(Error::InvalidConfig(_))
        ));
    }
}

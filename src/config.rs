use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub kingraph: KingraphConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
}

/// Storage and process settings
#[derive(Debug, Clone, Deserialize)]
pub struct KingraphConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for KingraphConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            migrations_dir: default_migrations_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Placeholder identity settings
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Reserved pseudo-domain used for synthetic placeholder account emails.
    #[serde(default = "default_placeholder_domain")]
    pub placeholder_domain: String,
    /// Name given to a placeholder when neither a name nor an email local-part is usable.
    #[serde(default = "default_display_name")]
    pub default_display_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            placeholder_domain: default_placeholder_domain(),
            default_display_name: default_display_name(),
        }
    }
}

/// Component discovery limits
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    /// Safety cap on visited profiles per discovery.
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            max_nodes: default_max_nodes(),
        }
    }
}

/// Default radial layout geometry
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_base_radius")]
    pub base_radius: f64,
    /// Extra radius per discovered node.
    #[serde(default = "default_radius_step")]
    pub radius_step: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            base_radius: default_base_radius(),
            radius_step: default_radius_step(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("kingraph.db")
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_placeholder_domain() -> String {
    "family.local".to_string()
}

fn default_display_name() -> String {
    "Family Member".to_string()
}

fn default_max_hops() -> usize {
    5
}

fn default_max_nodes() -> usize {
    5000
}

fn default_base_radius() -> f64 {
    100.0
}

fn default_radius_step() -> f64 {
    50.0
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in KINGRAPH_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("KINGRAPH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let domain = &self.identity.placeholder_domain;
        if domain.trim().is_empty() || domain.contains('@') {
            anyhow::bail!(
                "identity.placeholder_domain must be a bare domain such as family.local, got {:?}",
                domain
            );
        }

        if self.discovery.max_nodes == 0 {
            anyhow::bail!("discovery.max_nodes must be greater than 0");
        }

        for (name, value) in [
            ("layout.base_radius", self.layout.base_radius),
            ("layout.radius_step", self.layout.radius_step),
        ] {
            if !value.is_finite() || value < 0.0 {
                anyhow::bail!("{} must be a non-negative number, got {}", name, value);
            }
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.kingraph.db_path
    }

    /// Get the migrations directory
    pub fn migrations_dir(&self) -> &Path {
        &self.kingraph.migrations_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    const FULL_CONFIG: &str = r#"
[kingraph]
db_path = "./family.db"
log_level = "debug"

[identity]
placeholder_domain = "kin.invalid"

[discovery]
max_hops = 3
max_nodes = 200

[layout]
base_radius = 80.0
radius_step = 25.0
"#;

    #[test]
    fn test_config_defaults_from_empty_file() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.kingraph.log_level, "info");
        assert_eq!(config.migrations_dir(), Path::new("migrations"));
        assert_eq!(config.identity.placeholder_domain, "family.local");
        assert_eq!(config.discovery.max_hops, 5);
        assert_eq!(config.layout.radius_step, 50.0);
    }

    #[test]
    fn test_config_full_file() {
        let config = Config::from_toml_str(FULL_CONFIG).unwrap();
        assert_eq!(config.db_path(), Path::new("./family.db"));
        assert_eq!(config.kingraph.log_level, "debug");
        assert_eq!(config.identity.placeholder_domain, "kin.invalid");
        assert_eq!(config.identity.default_display_name, "Family Member");
        assert_eq!(config.discovery.max_hops, 3);
        assert_eq!(config.discovery.max_nodes, 200);
        assert_eq!(config.layout.base_radius, 80.0);
    }

    #[test]
    fn test_config_rejects_bad_placeholder_domain() {
        let err = Config::from_toml_str("[identity]\nplaceholder_domain = \"x@y\"\n").unwrap_err();
        assert!(err.to_string().contains("placeholder_domain"));
    }

    #[test]
    fn test_config_rejects_zero_node_cap() {
        let err = Config::from_toml_str("[discovery]\nmax_nodes = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_nodes"));
    }

    #[test]
    fn test_config_rejects_negative_radius() {
        let err = Config::from_toml_str("[layout]\nbase_radius = -1.0\n").unwrap_err();
        assert!(err.to_string().contains("layout.base_radius"));
    }

    #[test]
    fn test_config_load_from_env_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("kingraph.toml");
        fs::write(&config_path, FULL_CONFIG).unwrap();

        let original = std::env::var("KINGRAPH_CONFIG").ok();
        std::env::set_var("KINGRAPH_CONFIG", &config_path);
        let config = Config::load();
        std::env::remove_var("KINGRAPH_CONFIG");
        if let Some(v) = original {
            std::env::set_var("KINGRAPH_CONFIG", v);
        }

        let config = config.unwrap();
        assert_eq!(config.discovery.max_hops, 3);
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("KINGRAPH_CONFIG").ok();
        std::env::set_var("KINGRAPH_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        std::env::remove_var("KINGRAPH_CONFIG");
        if let Some(v) = original {
            std::env::set_var("KINGRAPH_CONFIG", v);
        }
    }
}

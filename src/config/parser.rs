//! Configuration parser for loading desired state.
//!
//! Configuration comes from a YAML file, with provider credentials
//! overridable from the environment (and a `.env` file next to it).

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, NebulaError, Result};

use super::spec::DeployConfig;

/// Environment variable overriding `provider.endpoint`.
pub const ENV_ENDPOINT: &str = "OPENNEBULA_ENDPOINT";

/// Environment variable overriding `provider.username`.
pub const ENV_USERNAME: &str = "OPENNEBULA_USERNAME";

/// Environment variable overriding `provider.password`.
pub const ENV_PASSWORD: &str = "OPENNEBULA_PASSWORD";

/// Configuration parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for locating the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for locating the `.env` file.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(NebulaError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            NebulaError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            NebulaError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed configuration with {} managed resources",
            config.resource_count()
        );
        Ok(config)
    }

    /// Loads configuration and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies provider overrides from a variable lookup.
    fn apply_env_overrides(config: &mut DeployConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = endpoint;
        }

        if let Some(username) = lookup(ENV_USERNAME) {
            debug!("Overriding provider.username from environment");
            config.provider.username = username;
        }

        if let Some(password) = lookup(ENV_PASSWORD) {
            debug!("Overriding provider.password from environment");
            config.provider.password = password;
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                NebulaError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Checks that the provider block is complete.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] naming the variable that would
    /// supply the first missing value.
    pub fn require_provider(config: &DeployConfig) -> Result<()> {
        let provider = &config.provider;
        for (value, var) in [
            (&provider.endpoint, ENV_ENDPOINT),
            (&provider.username, ENV_USERNAME),
            (&provider.password, ENV_PASSWORD),
        ] {
            if value.is_empty() {
                return Err(NebulaError::Config(ConfigError::MissingEnvVar {
                    name: var.to_string(),
                }));
            }
        }
        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["nebula.yaml", "nebula.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(NebulaError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageType;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
provider:
  endpoint: http://one:2633/RPC2
  username: oneadmin
  password: secret
";
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("parse failed");

        assert_eq!(config.provider.username, "oneadmin");
        assert_eq!(config.resource_count(), 0);
        assert_eq!(config.wait.timeout_secs, 600);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
provider:
  endpoint: http://one:2633/RPC2
  username: oneadmin
  password: secret

wait:
  timeout_secs: 120

security_groups:
  - name: web
    rules:
      - protocol: TCP
        rule_type: INBOUND
        range: "22,80,443"
      - protocol: ALL
        rule_type: OUTBOUND

vnets:
  - name: private
    bridge: br0
    ip_start: 10.0.0.5
    ip_size: 16
    hold_size: 3
    security_groups: [0]

images:
  - name: base
    datastore_id: 1
    path: http://example.com/base.qcow2
    type: OS
    permissions: "640"

vms:
  - name: web-1
    cpu: 0.5
    vcpu: 2
    memory: 1024
    context:
      NETWORK: "YES"
    disks:
      - image_id: 7
    nics:
      - network_id: 2
        security_groups: [0, 4]

users: [alice]
groups: ["100"]
"#;
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("parse failed");

        assert_eq!(config.wait.timeout_secs, 120);
        assert_eq!(config.wait.poll_interval_secs, 5);
        assert_eq!(config.security_groups[0].rules.len(), 2);
        assert!(config.security_groups[0].commit);
        assert_eq!(config.vnets[0].hold_size, 3);
        assert_eq!(config.images[0].image_type, Some(ImageType::Os));
        assert_eq!(config.vms[0].nics[0].security_groups, vec![0, 4]);
        assert_eq!(config.resource_count(), 4);
        assert_eq!(config.users, vec![String::from("alice")]);
    }

    #[test]
    fn test_unknown_image_type_is_a_parse_error() {
        let yaml = "images:\n  - name: x\n    datastore_id: 1\n    type: FLOPPY\n";
        assert!(matches!(
            ConfigParser::new().parse_yaml(yaml, None),
            Err(NebulaError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_env_overrides_provider() {
        let mut config = ConfigParser::new()
            .parse_yaml("provider:\n  username: oneadmin\n", None)
            .expect("parse failed");
        let env = HashMap::from([
            (ENV_ENDPOINT, "http://other:2633/RPC2"),
            (ENV_PASSWORD, "from-env"),
        ]);

        ConfigParser::apply_env_overrides(&mut config, |name| {
            env.get(name).map(ToString::to_string)
        });

        assert_eq!(config.provider.endpoint, "http://other:2633/RPC2");
        assert_eq!(config.provider.username, "oneadmin");
        assert_eq!(config.provider.password, "from-env");
        assert!(ConfigParser::require_provider(&config).is_ok());
    }

    #[test]
    fn test_missing_provider_value_names_variable() {
        let config = ConfigParser::new()
            .parse_yaml("provider:\n  endpoint: http://one:2633/RPC2\n", None)
            .expect("parse failed");

        match ConfigParser::require_provider(&config) {
            Err(NebulaError::Config(ConfigError::MissingEnvVar { name })) => {
                assert_eq!(name, ENV_USERNAME);
            }
            other => panic!("expected missing variable, got {other:?}"),
        }
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("nebula.yaml"), "{}").expect("write");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("not found");
        assert_eq!(found, dir.path().join("nebula.yaml"));
    }
}

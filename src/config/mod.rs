//! Configuration module.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `nebula.yaml`
//! - Validation of configuration values before any remote call
//! - Computing configuration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    DeployConfig, DiskConfig, GraphicsConfig, ImageConfig, ImageType, NicConfig, OsConfig,
    ProviderConfig, RawConfig, ResourceConfig, RuleDirection, RuleProtocol, SecurityGroupConfig,
    SecurityRule, StateConfig, VmConfig, VnetConfig, WaitConfig,
};
pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, ENV_ENDPOINT, ENV_PASSWORD, ENV_USERNAME,
    find_config_file,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;

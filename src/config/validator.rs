//! Configuration validation.
//!
//! Everything here runs before the first remote call. A configuration that
//! fails validation is never partially applied.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use tracing::debug;

use crate::drivers::lease_walk;
use crate::error::{ConfigError, NebulaError, Result};
use crate::permissions::Permissions;

use super::spec::{
    DeployConfig, ImageConfig, RuleProtocol, SecurityGroupConfig, VmConfig, VnetConfig, WaitConfig,
};

/// Validator for desired configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!(
                "Configuration validation passed with {} warnings",
                result.warnings.len()
            );
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(NebulaError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_provider(config, &mut result);
        Self::validate_wait(&config.wait, &mut result);

        let mut names = HashSet::new();
        for (i, group) in config.security_groups.iter().enumerate() {
            let field = format!("security_groups[{i}]");
            Self::validate_name("secgroup", &group.name, &field, &mut names, &mut result);
            Self::validate_permissions(group.permissions.as_deref(), &field, &mut result);
            Self::validate_security_group(group, &field, &mut result);
        }

        for (i, vnet) in config.vnets.iter().enumerate() {
            let field = format!("vnets[{i}]");
            Self::validate_name("vnet", &vnet.name, &field, &mut names, &mut result);
            Self::validate_permissions(vnet.permissions.as_deref(), &field, &mut result);
            Self::validate_vnet(vnet, &field, &mut result);
        }

        for (i, image) in config.images.iter().enumerate() {
            let field = format!("images[{i}]");
            Self::validate_name("image", &image.name, &field, &mut names, &mut result);
            Self::validate_permissions(image.permissions.as_deref(), &field, &mut result);
            Self::validate_image(image, &field, &mut result);
        }

        for (i, vm) in config.vms.iter().enumerate() {
            let field = format!("vms[{i}]");
            if let Some(name) = vm.name.as_deref() {
                Self::validate_name("vm", name, &field, &mut names, &mut result);
                if name.starts_with('#') {
                    result.error(
                        format!("{field}.name"),
                        "VM names starting with '#' are reserved for unnamed VMs",
                    );
                }
            }
            Self::validate_permissions(vm.permissions.as_deref(), &field, &mut result);
            Self::validate_vm(vm, &field, &mut result);
        }

        result
    }

    fn validate_provider(config: &DeployConfig, result: &mut ValidationResult) {
        let endpoint = &config.provider.endpoint;
        if endpoint.is_empty() {
            result.warn("provider.endpoint is empty; it must come from the environment");
        } else if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            result.error(
                "provider.endpoint",
                format!("Endpoint '{endpoint}' must be an http(s) URL"),
            );
        }
    }

    fn validate_wait(wait: &WaitConfig, result: &mut ValidationResult) {
        if wait.timeout_secs == 0 {
            result.error("wait.timeout_secs", "Wait timeout must be at least 1 second");
        }
        if wait.poll_interval_secs < wait.min_poll_interval_secs {
            result.warn(format!(
                "wait.poll_interval_secs ({}) is below min_poll_interval_secs ({}); the minimum applies",
                wait.poll_interval_secs, wait.min_poll_interval_secs
            ));
        }
    }

    fn validate_name(
        kind: &str,
        name: &str,
        field: &str,
        seen: &mut HashSet<String>,
        result: &mut ValidationResult,
    ) {
        if name.trim().is_empty() {
            result.error(format!("{field}.name"), format!("A {kind} needs a name"));
        } else if !seen.insert(format!("{kind}/{name}")) {
            result.error(
                format!("{field}.name"),
                format!("Duplicate {kind} name: {name}"),
            );
        }
    }

    fn validate_permissions(permissions: Option<&str>, field: &str, result: &mut ValidationResult) {
        if let Some(permissions) = permissions
            && let Err(e) = Permissions::encode(permissions)
        {
            result.error(format!("{field}.permissions"), e.to_string());
        }
    }

    fn validate_security_group(
        group: &SecurityGroupConfig,
        field: &str,
        result: &mut ValidationResult,
    ) {
        for (i, rule) in group.rules.iter().enumerate() {
            let rule_field = format!("{field}.rules[{i}]");
            if rule.range.is_some() && !matches!(rule.protocol, RuleProtocol::Tcp | RuleProtocol::Udp) {
                result.error(
                    format!("{rule_field}.range"),
                    format!("Port ranges only apply to TCP and UDP rules, not {}", rule.protocol.as_str()),
                );
            }
            if rule.icmp_type.is_some() && rule.protocol != RuleProtocol::Icmp {
                result.error(
                    format!("{rule_field}.icmp_type"),
                    "icmp_type only applies to ICMP rules",
                );
            }
            if rule.size.is_some() && rule.ip.is_none() {
                result.error(format!("{rule_field}.size"), "size requires ip");
            }
            if rule.network_id.is_some() && rule.ip.is_some() {
                result.error(
                    format!("{rule_field}.network_id"),
                    "A rule targets either an IP range or a network, not both",
                );
            }
        }
        if !group.commit && group.commit_outdated_only {
            result.warn(format!("{field}: commit_outdated_only has no effect without commit"));
        }
    }

    fn validate_vnet(vnet: &VnetConfig, field: &str, result: &mut ValidationResult) {
        if let Some(source) = vnet.reservation_vnet {
            if source <= 0 {
                result.error(
                    format!("{field}.reservation_vnet"),
                    "Reservation network ID must be greater than 0",
                );
            }
            if vnet.reservation_size.unwrap_or_default() <= 0 {
                result.error(
                    format!("{field}.reservation_size"),
                    "Reservation size must be greater than 0",
                );
            }
            if vnet.bridge.is_some()
                || vnet.ip_start.is_some()
                || vnet.ip_size.is_some()
                || vnet.hold_size > 0
            {
                result.error(
                    field.to_string(),
                    "A reservation cannot set bridge, ip_start, ip_size or hold_size",
                );
            }
            return;
        }

        if vnet.reservation_size.is_some() {
            result.error(
                format!("{field}.reservation_size"),
                "reservation_size requires reservation_vnet",
            );
        }

        match vnet.ip_start.as_deref() {
            Some(ip_start) => {
                if ip_start.parse::<Ipv4Addr>().is_err() {
                    result.error(
                        format!("{field}.ip_start"),
                        format!("'{ip_start}' is not an IPv4 address"),
                    );
                } else if let Err(e) = lease_walk(ip_start, vnet.hold_size) {
                    result.error(format!("{field}.hold_size"), e.to_string());
                }
                if vnet.hold_size > vnet.ip_size.unwrap_or(1) {
                    result.warn(format!(
                        "{field}: hold_size {} exceeds the address range size",
                        vnet.hold_size
                    ));
                }
            }
            None => {
                if vnet.hold_size > 0 || vnet.ip_size.is_some() {
                    result.error(
                        format!("{field}.ip_start"),
                        "ip_size and hold_size require ip_start",
                    );
                }
            }
        }

        if vnet.bridge.is_none() {
            result.warn(format!("{field}: no bridge set; the default bridge applies"));
        }
    }

    fn validate_image(image: &ImageConfig, field: &str, result: &mut ValidationResult) {
        let cloning = image.clone_from_image.as_deref().is_some_and(|s| !s.is_empty());

        if cloning && image.path.is_some() {
            result.error(
                format!("{field}.clone_from_image"),
                "clone_from_image and path are mutually exclusive",
            );
        }
        if !cloning && image.path.is_none() && image.size.is_none() {
            result.error(
                field.to_string(),
                "An image needs a path, a size or clone_from_image",
            );
        }
        if image.datastore_id < 0 {
            result.error(
                format!("{field}.datastore_id"),
                "Datastore ID cannot be negative",
            );
        }
        if let Some(size) = image.size
            && size <= 0
        {
            result.error(format!("{field}.size"), "Image size must be positive");
        }
    }

    fn validate_vm(vm: &VmConfig, field: &str, result: &mut ValidationResult) {
        for key in vm.context.keys() {
            if !is_element_name(key) {
                result.error(
                    format!("{field}.context.{key}"),
                    format!("Context key '{key}' must be letters, digits or '_' and not start with a digit"),
                );
            }
        }

        if vm.template_id.is_some() {
            let inline_body = vm.cpu.is_some()
                || vm.vcpu.is_some()
                || vm.memory.is_some()
                || !vm.context.is_empty()
                || !vm.disks.is_empty()
                || !vm.nics.is_empty()
                || vm.graphics.is_some()
                || vm.os.is_some()
                || vm.raw.is_some();
            if inline_body {
                result.error(
                    format!("{field}.template_id"),
                    "template_id cannot be combined with an inline VM body",
                );
            }
            return;
        }

        match vm.cpu {
            None => result.error(format!("{field}.cpu"), "cpu is required without template_id"),
            Some(cpu) if cpu <= 0.0 => result.error(format!("{field}.cpu"), "cpu must be positive"),
            Some(_) => {}
        }
        match vm.memory {
            None => result.error(
                format!("{field}.memory"),
                "memory is required without template_id",
            ),
            Some(0) => result.error(format!("{field}.memory"), "memory must be positive"),
            Some(_) => {}
        }
        if vm.vcpu == Some(0) {
            result.error(format!("{field}.vcpu"), "vcpu must be positive");
        }
        for (i, nic) in vm.nics.iter().enumerate() {
            if nic.security_groups.iter().any(|g| *g < 0) {
                result.error(
                    format!("{field}.nics[{i}].security_groups"),
                    "Security group IDs cannot be negative",
                );
            }
        }
    }
}

/// Returns true if `key` can be used as a template element name.
fn is_element_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

//! Configuration specification types for the reconciliation engine.
//!
//! This module defines all the structs that map to the `nebula.yaml` file.
//! Each resource record is the desired state of one remote object; the
//! engine never defaults a field the file leaves out.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivers::ResourceKind;
use crate::poller::PollConfig;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    /// Remote endpoint and credentials.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Poller timing.
    #[serde(default)]
    pub wait: WaitConfig,
    /// Applied-state storage.
    #[serde(default)]
    pub state: StateConfig,
    /// Security groups.
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupConfig>,
    /// Virtual networks.
    #[serde(default)]
    pub vnets: Vec<VnetConfig>,
    /// Disk images.
    #[serde(default)]
    pub images: Vec<ImageConfig>,
    /// Virtual machines.
    #[serde(default)]
    pub vms: Vec<VmConfig>,
    /// Users to look up (ID or name). Read-only.
    #[serde(default)]
    pub users: Vec<String>,
    /// Groups to look up (ID or name). Read-only.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Remote endpoint and credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// XML-RPC endpoint URL.
    #[serde(default)]
    pub endpoint: String,
    /// User name.
    #[serde(default)]
    pub username: String,
    /// Password.
    #[serde(default)]
    pub password: String,
}

/// Poller timing, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitConfig {
    /// Interval between refreshes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Delay before the first refresh.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    /// Lower bound for the refresh interval.
    #[serde(default = "default_min_poll_interval")]
    pub min_poll_interval_secs: u64,
    /// Deadline for one wait.
    #[serde(default = "default_wait_timeout")]
    pub timeout_secs: u64,
}

/// Applied-state storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Directory holding the state and lock files.
    #[serde(default)]
    pub path: Option<String>,
}

/// Image types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageType {
    /// Bootable operating system disk.
    Os,
    /// Read-only CD-ROM image.
    Cdrom,
    /// Empty or pre-filled data disk.
    Datablock,
    /// Kernel file.
    Kernel,
    /// Ramdisk file.
    Ramdisk,
    /// Contextualization file.
    Context,
}

/// A disk image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageConfig {
    /// Image name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Permission string (e.g. `"640"`).
    #[serde(default)]
    pub permissions: Option<String>,
    /// Owner user ID to assign.
    #[serde(default)]
    pub uid: Option<i64>,
    /// Owner group ID to assign.
    #[serde(default)]
    pub gid: Option<i64>,
    /// ID or name of an image to clone instead of allocating.
    #[serde(default)]
    pub clone_from_image: Option<String>,
    /// Target datastore.
    pub datastore_id: i64,
    /// Whether the image is persistent.
    #[serde(default)]
    pub persistent: bool,
    /// Source path or URL.
    #[serde(default)]
    pub path: Option<String>,
    /// Image type.
    #[serde(default, rename = "type")]
    pub image_type: Option<ImageType>,
    /// Size in MB.
    #[serde(default)]
    pub size: Option<i64>,
    /// Device prefix (`hd`, `sd`, `vd`).
    #[serde(default)]
    pub dev_prefix: Option<String>,
    /// Disk driver (`raw`, `qcow2`).
    #[serde(default)]
    pub driver: Option<String>,
    /// Target device.
    #[serde(default)]
    pub target: Option<String>,
    /// Image format.
    #[serde(default)]
    pub format: Option<String>,
    /// Expected MD5 of the source.
    #[serde(default)]
    pub md5: Option<String>,
    /// Expected SHA1 of the source.
    #[serde(default)]
    pub sha1: Option<String>,
}

/// Security group rule protocols.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleProtocol {
    /// Any protocol.
    All,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
    /// IPsec.
    Ipsec,
}

/// Security group rule directions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleDirection {
    /// Incoming traffic.
    Inbound,
    /// Outgoing traffic.
    Outbound,
}

/// One security group rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecurityRule {
    /// Protocol.
    pub protocol: RuleProtocol,
    /// Direction.
    pub rule_type: RuleDirection,
    /// First IP the rule applies to.
    #[serde(default)]
    pub ip: Option<String>,
    /// Number of IPs starting at `ip`.
    #[serde(default)]
    pub size: Option<String>,
    /// Comma-separated ports and port ranges.
    #[serde(default)]
    pub range: Option<String>,
    /// ICMP type for ICMP rules.
    #[serde(default)]
    pub icmp_type: Option<String>,
    /// Network whose addresses the rule applies to.
    #[serde(default)]
    pub network_id: Option<String>,
}

/// A security group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityGroupConfig {
    /// Group name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Permission string.
    #[serde(default)]
    pub permissions: Option<String>,
    /// Owner user ID to assign.
    #[serde(default)]
    pub uid: Option<i64>,
    /// Owner group ID to assign.
    #[serde(default)]
    pub gid: Option<i64>,
    /// Rules. Order is not significant.
    #[serde(default)]
    pub rules: Vec<SecurityRule>,
    /// Push rule changes to VMs using the group.
    #[serde(default = "default_true")]
    pub commit: bool,
    /// When committing, only retry VMs left outdated or in error by an
    /// earlier commit.
    #[serde(default)]
    pub commit_outdated_only: bool,
}

/// A VM disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskConfig {
    /// Image to attach.
    pub image_id: i64,
    /// Size in MB.
    #[serde(default)]
    pub size: Option<i64>,
    /// Target device.
    #[serde(default)]
    pub target: Option<String>,
    /// Disk driver.
    #[serde(default)]
    pub driver: Option<String>,
}

/// A VM network interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NicConfig {
    /// Network to attach.
    pub network_id: i64,
    /// Fixed IP.
    #[serde(default)]
    pub ip: Option<String>,
    /// NIC model.
    #[serde(default)]
    pub model: Option<String>,
    /// Security groups applied to the NIC.
    #[serde(default)]
    pub security_groups: Vec<i64>,
}

/// VM graphics adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphicsConfig {
    /// Listen address.
    pub listen: String,
    /// Adapter type (e.g. `VNC`).
    #[serde(rename = "type")]
    pub graphics_type: String,
}

/// VM boot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsConfig {
    /// CPU architecture.
    pub arch: String,
    /// Boot device order.
    pub boot: String,
}

/// Raw hypervisor passthrough.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawConfig {
    /// Hypervisor type.
    #[serde(rename = "type")]
    pub raw_type: String,
    /// Raw data.
    pub data: String,
}

/// A virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmConfig {
    /// VM name. When absent the remote side picks one.
    #[serde(default)]
    pub name: Option<String>,
    /// Template to instantiate instead of an inline body.
    #[serde(default)]
    pub template_id: Option<i64>,
    /// Permission string.
    #[serde(default)]
    pub permissions: Option<String>,
    /// Owner user ID to assign.
    #[serde(default)]
    pub uid: Option<i64>,
    /// Owner group ID to assign.
    #[serde(default)]
    pub gid: Option<i64>,
    /// CPU quota.
    #[serde(default)]
    pub cpu: Option<f64>,
    /// Virtual CPUs.
    #[serde(default)]
    pub vcpu: Option<u32>,
    /// Memory in MB.
    #[serde(default)]
    pub memory: Option<u64>,
    /// Context variables.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Disks.
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    /// Network interfaces.
    #[serde(default)]
    pub nics: Vec<NicConfig>,
    /// Graphics adapter.
    #[serde(default)]
    pub graphics: Option<GraphicsConfig>,
    /// Boot settings.
    #[serde(default)]
    pub os: Option<OsConfig>,
    /// Raw passthrough.
    #[serde(default)]
    pub raw: Option<RawConfig>,
}

/// A virtual network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VnetConfig {
    /// Network name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Permission string.
    #[serde(default)]
    pub permissions: Option<String>,
    /// Owner user ID to assign.
    #[serde(default)]
    pub uid: Option<i64>,
    /// Owner group ID to assign.
    #[serde(default)]
    pub gid: Option<i64>,
    /// Host bridge.
    #[serde(default)]
    pub bridge: Option<String>,
    /// First address of the range.
    #[serde(default)]
    pub ip_start: Option<String>,
    /// Number of addresses in the range.
    #[serde(default)]
    pub ip_size: Option<u32>,
    /// Number of leases to hold starting at `ip_start`.
    #[serde(default)]
    pub hold_size: u32,
    /// Network to carve a reservation from.
    #[serde(default)]
    pub reservation_vnet: Option<i64>,
    /// Number of addresses to reserve.
    #[serde(default)]
    pub reservation_size: Option<i64>,
    /// Security groups applied to the network.
    #[serde(default)]
    pub security_groups: Vec<i64>,
}

/// One configured resource, tagged with its kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceConfig {
    /// A security group.
    SecurityGroup(SecurityGroupConfig),
    /// A virtual network.
    Vnet(VnetConfig),
    /// A disk image.
    Image(ImageConfig),
    /// A virtual machine.
    Vm(VmConfig),
}

const fn default_poll_interval() -> u64 {
    5
}

const fn default_initial_delay() -> u64 {
    10
}

const fn default_min_poll_interval() -> u64 {
    3
}

const fn default_wait_timeout() -> u64 {
    600
}

const fn default_true() -> bool {
    true
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            initial_delay_secs: default_initial_delay(),
            min_poll_interval_secs: default_min_poll_interval(),
            timeout_secs: default_wait_timeout(),
        }
    }
}

impl WaitConfig {
    /// Converts to poller timing.
    #[must_use]
    pub const fn poll_config(&self) -> PollConfig {
        PollConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            min_poll_interval: Duration::from_secs(self.min_poll_interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

impl ImageType {
    /// Returns the numeric code used in image documents.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Os => 0,
            Self::Cdrom => 1,
            Self::Datablock => 2,
            Self::Kernel => 3,
            Self::Ramdisk => 4,
            Self::Context => 5,
        }
    }

    /// Maps a numeric code back to a type.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Os),
            1 => Some(Self::Cdrom),
            2 => Some(Self::Datablock),
            3 => Some(Self::Kernel),
            4 => Some(Self::Ramdisk),
            5 => Some(Self::Context),
            _ => None,
        }
    }

    /// Returns the keyword used in templates.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Os => "OS",
            Self::Cdrom => "CDROM",
            Self::Datablock => "DATABLOCK",
            Self::Kernel => "KERNEL",
            Self::Ramdisk => "RAMDISK",
            Self::Context => "CONTEXT",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RuleProtocol {
    /// Returns the keyword used in templates.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
            Self::Ipsec => "IPSEC",
        }
    }

    /// Parses a template keyword.
    #[must_use]
    pub fn parse(keyword: &str) -> Option<Self> {
        [Self::All, Self::Tcp, Self::Udp, Self::Icmp, Self::Ipsec]
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(keyword))
    }
}

impl RuleDirection {
    /// Returns the keyword used in templates.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "INBOUND",
            Self::Outbound => "OUTBOUND",
        }
    }

    /// Parses a template keyword.
    #[must_use]
    pub fn parse(keyword: &str) -> Option<Self> {
        [Self::Inbound, Self::Outbound]
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(keyword))
    }
}

impl VmConfig {
    /// Returns the declared name, or an empty string when the remote side
    /// picks one.
    #[must_use]
    pub fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }
}

impl ResourceConfig {
    /// Returns the resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::SecurityGroup(_) => ResourceKind::SecurityGroup,
            Self::Vnet(_) => ResourceKind::Vnet,
            Self::Image(_) => ResourceKind::Image,
            Self::Vm(_) => ResourceKind::Vm,
        }
    }

    /// Returns the declared name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::SecurityGroup(c) => &c.name,
            Self::Vnet(c) => &c.name,
            Self::Image(c) => &c.name,
            Self::Vm(c) => c.name_or_empty(),
        }
    }

    /// Returns the state key, e.g. `image/base-os`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind().label(), self.name())
    }

    /// Returns the requested permission string, if any.
    #[must_use]
    pub fn permissions(&self) -> Option<&str> {
        match self {
            Self::SecurityGroup(c) => c.permissions.as_deref(),
            Self::Vnet(c) => c.permissions.as_deref(),
            Self::Image(c) => c.permissions.as_deref(),
            Self::Vm(c) => c.permissions.as_deref(),
        }
    }
}

impl DeployConfig {
    /// Returns every configured resource in reconciliation order:
    /// security groups, networks, images, then VMs.
    #[must_use]
    pub fn resources(&self) -> Vec<ResourceConfig> {
        self.security_groups
            .iter()
            .cloned()
            .map(ResourceConfig::SecurityGroup)
            .chain(self.vnets.iter().cloned().map(ResourceConfig::Vnet))
            .chain(self.images.iter().cloned().map(ResourceConfig::Image))
            .chain(self.vms.iter().cloned().map(ResourceConfig::Vm))
            .collect()
    }

    /// Returns every configured resource with its state key, in
    /// reconciliation order.
    ///
    /// An unnamed VM is keyed by its position in `vms`, e.g. `vm/#2`, since
    /// the remote side only picks its name at creation.
    #[must_use]
    pub fn keyed_resources(&self) -> Vec<(String, ResourceConfig)> {
        let mut vm_index = 0;
        self.resources()
            .into_iter()
            .map(|resource| {
                let key = match &resource {
                    ResourceConfig::Vm(vm) => {
                        let index = vm_index;
                        vm_index += 1;
                        if vm.name_or_empty().is_empty() {
                            format!("{}/#{index}", ResourceKind::Vm.label())
                        } else {
                            resource.key()
                        }
                    }
                    _ => resource.key(),
                };
                (key, resource)
            })
            .collect()
    }

    /// Returns the number of managed resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.security_groups.len() + self.vnets.len() + self.images.len() + self.vms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_type_codes() {
        for code in 0..6 {
            let image_type = ImageType::from_code(code).expect("known code");
            assert_eq!(image_type.code(), code);
        }
        assert_eq!(ImageType::from_code(6), None);
        assert_eq!(ImageType::Datablock.to_string(), "DATABLOCK");
    }

    #[test]
    fn test_rule_keywords() {
        assert_eq!(RuleProtocol::parse("icmp"), Some(RuleProtocol::Icmp));
        assert_eq!(RuleProtocol::parse("SCTP"), None);
        assert_eq!(RuleDirection::parse("OUTBOUND"), Some(RuleDirection::Outbound));
    }

    #[test]
    fn test_resource_config_is_tagged_by_kind() {
        let yaml = "kind: vnet\nname: private\nbridge: br0\n";
        let resource: ResourceConfig = serde_yaml::from_str(yaml).expect("parse failed");
        assert_eq!(resource.kind(), ResourceKind::Vnet);
        assert_eq!(resource.key(), "vnet/private");
    }

    #[test]
    fn test_unnamed_vms_are_keyed_by_position() {
        let yaml = "vms:\n  - template_id: 4\n  - name: web\n    template_id: 4\n  - template_id: 5\n";
        let config: DeployConfig = serde_yaml::from_str(yaml).expect("parse failed");

        let keys: Vec<String> = config.keyed_resources().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["vm/#0", "vm/web", "vm/#2"]);
    }

    #[test]
    fn test_wait_defaults() {
        let wait = WaitConfig::default().poll_config();
        assert_eq!(wait.timeout, Duration::from_secs(600));
        assert_eq!(wait.initial_delay, Duration::from_secs(10));
        assert_eq!(wait.min_poll_interval, Duration::from_secs(3));
    }
}

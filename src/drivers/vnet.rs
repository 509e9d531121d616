//! Virtual network driver and lease manager.
//!
//! A network is either a reservation carved out of an existing network or a
//! fresh allocation with one IPv4 address range. Fresh networks can hold a
//! run of leases starting at the first address; the same run is released
//! before the network is deleted.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::VnetConfig;
use crate::error::{ConfigError, ReconcileError, RemoteError, Result};
use crate::one::{ObjectHeader, PoolScope, RemoteCall, Value};
use crate::planner::{UpdatePlan, UpdateStep};
use crate::template::{
    address_range, address_range_update, lease, reservation, AttributeTemplate, Element,
    UpdateMode,
};

use super::{
    plan_access_changes, rename_call, update_call, AllocationRecorder, DriverContext,
    ResourceDriver, ResourceKind, ResourceSummary,
};

/// Walks `count` addresses from `ip_start` by incrementing the last octet.
///
/// Higher octets never change; a walk that would run past `.255` is
/// rejected instead of wrapping.
///
/// # Errors
///
/// Returns a validation error if `ip_start` is not an IPv4 address or the
/// walk overflows the last octet.
pub fn lease_walk(ip_start: &str, count: u32) -> Result<Vec<Ipv4Addr>> {
    let start: Ipv4Addr = ip_start.trim().parse().map_err(|_| {
        ConfigError::validation(format!("'{ip_start}' is not an IPv4 address"), "ip_start")
    })?;

    if count == 0 {
        return Ok(Vec::new());
    }

    let [a, b, c, d] = start.octets();
    let last = u32::from(d).saturating_add(count - 1);
    if last > u32::from(u8::MAX) {
        return Err(ConfigError::validation(
            format!("holding {count} leases from {start} runs past {a}.{b}.{c}.255"),
            "hold_size",
        )
        .into());
    }

    Ok((0..count)
        .filter_map(|i| u8::try_from(u32::from(d) + i).ok())
        .map(|octet| Ipv4Addr::new(a, b, c, octet))
        .collect())
}

/// One observed address range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRangeObserved {
    /// Range index.
    pub ar_id: i64,
    /// First address.
    pub ip: String,
    /// Number of addresses.
    pub size: i64,
}

/// Projection of a virtual network document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnetObserved {
    /// Identity, ownership and permissions.
    pub header: ObjectHeader,
    /// Host bridge.
    pub bridge: String,
    /// Parent network, for reservations.
    pub parent_network_id: Option<i64>,
    /// Description.
    pub description: String,
    /// Security groups applied to the network.
    pub security_groups: Vec<i64>,
    /// Address ranges.
    pub address_ranges: Vec<AddressRangeObserved>,
}

fn parse_id_list(list: &str) -> Result<Vec<i64>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| {
                RemoteError::invalid(format!("security group list contains '{s}'")).into()
            })
        })
        .collect()
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

fn project_range(element: &Element) -> Result<AddressRangeObserved> {
    Ok(AddressRangeObserved {
        ar_id: element.child_i64("AR_ID")?.unwrap_or_default(),
        ip: element.text_or_empty("IP"),
        size: element.child_i64("SIZE")?.unwrap_or_default(),
    })
}

fn security_groups_call(id: i64, groups: &[i64]) -> RemoteCall {
    let body = AttributeTemplate::new().with("SECURITY_GROUPS", join_ids(groups));
    update_call(ResourceKind::Vnet, id, &body.to_string(), UpdateMode::Merge)
}

/// Drives virtual networks.
#[derive(Debug, Clone, Copy)]
pub struct VnetDriver<'a> {
    ctx: DriverContext<'a>,
}

impl<'a> VnetDriver<'a> {
    /// Creates the driver.
    #[must_use]
    pub const fn new(ctx: DriverContext<'a>) -> Self {
        Self { ctx }
    }

    async fn reserve(
        &self,
        desired: &VnetConfig,
        source: i64,
        recorder: &dyn AllocationRecorder,
    ) -> Result<i64> {
        let size = desired.reservation_size.unwrap_or_default();
        if source <= 0 {
            return Err(ConfigError::validation(
                "reservation network ID must be greater than 0",
                "reservation_vnet",
            )
            .into());
        }
        if size <= 0 {
            return Err(ConfigError::validation(
                "reservation size must be greater than 0",
                "reservation_size",
            )
            .into());
        }

        let id = self
            .ctx
            .call_for_id(
                &Self::KIND.method("reserve"),
                vec![Value::Int(source), Value::from(reservation(size, &desired.name))],
            )
            .await?;
        info!("Reserved {size} addresses from vnet {source} as vnet {id}");
        recorder.allocated(id).await?;
        Ok(id)
    }

    async fn allocate(&self, desired: &VnetConfig, recorder: &dyn AllocationRecorder) -> Result<i64> {
        let ctx = self.ctx;
        let leases = match desired.ip_start.as_deref() {
            Some(ip_start) => lease_walk(ip_start, desired.hold_size)?,
            None => Vec::new(),
        };

        let id = ctx
            .call_for_id(
                &Self::KIND.method("allocate"),
                vec![Value::from(self.build_template(desired)?), Value::Int(-1)],
            )
            .await?;
        info!("Allocated vnet {id} '{}'", desired.name);
        recorder.allocated(id).await?;

        ctx.apply_ownership(Self::KIND, id, desired.uid, desired.gid).await?;
        ctx.apply_permissions(Self::KIND, id, desired.permissions.as_deref())
            .await?;

        if let Some(ip_start) = desired.ip_start.as_deref() {
            let range = address_range(ip_start, desired.ip_size.unwrap_or(1));
            RemoteCall::new(
                Self::KIND.method("add_ar"),
                vec![Value::Int(id), Value::from(range.to_string())],
            )
            .send(ctx.session)
            .await?;
            info!("Added address range {ip_start} to vnet {id}");
        }

        self.walk_leases(id, "hold", &leases).await?;
        Ok(id)
    }

    async fn walk_leases(&self, id: i64, operation: &str, leases: &[Ipv4Addr]) -> Result<()> {
        let method = Self::KIND.method(operation);
        for ip in leases {
            RemoteCall::new(method.clone(), vec![Value::Int(id), Value::from(lease(*ip))])
                .send(self.ctx.session)
                .await?;
            debug!("{operation} {ip} on vnet {id}");
        }
        if !leases.is_empty() {
            info!("{operation}: {} leases on vnet {id}", leases.len());
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceDriver for VnetDriver<'_> {
    type Desired = VnetConfig;
    type Observed = VnetObserved;

    const KIND: ResourceKind = ResourceKind::Vnet;

    fn context(&self) -> &DriverContext<'_> {
        &self.ctx
    }

    fn desired_name<'d>(&self, desired: &'d VnetConfig) -> &'d str {
        &desired.name
    }

    fn build_template(&self, desired: &VnetConfig) -> Result<String> {
        Ok(AttributeTemplate::new()
            .with("NAME", &desired.name)
            .with_opt("DESCRIPTION", desired.description.as_deref())
            .with_opt("BRIDGE", desired.bridge.as_deref())
            .to_string())
    }

    fn project(&self, document: &Element) -> Result<VnetObserved> {
        let template = document.child("TEMPLATE");
        let address_ranges = document
            .child("AR_POOL")
            .map(|pool| pool.children_named("AR").map(project_range).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();

        Ok(VnetObserved {
            header: ObjectHeader::from_element(document)?,
            bridge: document.text_or_empty("BRIDGE"),
            parent_network_id: document.child_i64("PARENT_NETWORK_ID")?.filter(|p| *p >= 0),
            description: template
                .map(|t| t.text_or_empty("DESCRIPTION"))
                .unwrap_or_default(),
            security_groups: template
                .and_then(|t| t.child_text("SECURITY_GROUPS"))
                .map(parse_id_list)
                .transpose()?
                .unwrap_or_default(),
            address_ranges,
        })
    }

    fn summarize(&self, observed: &VnetObserved) -> ResourceSummary {
        let size: i64 = observed.address_ranges.iter().map(|ar| ar.size).sum();
        ResourceSummary::from_header(
            Self::KIND,
            &observed.header,
            format!("{size} addresses"),
            observed,
        )
    }

    fn plan_update(&self, id: i64, old: &VnetConfig, new: &VnetConfig) -> Result<UpdatePlan> {
        let mut plan = UpdatePlan::new(Self::KIND, id);

        if old.description != new.description {
            let body = AttributeTemplate::new()
                .with("DESCRIPTION", new.description.as_deref().unwrap_or_default());
            plan.add(
                UpdateStep::Body,
                update_call(Self::KIND, id, &body.to_string(), UpdateMode::Merge),
            );
        }

        if old.name != new.name {
            plan.add(UpdateStep::Rename, rename_call(Self::KIND, id, &new.name));
        }

        if old.ip_start != new.ip_start {
            warn!("Changing the first address of vnet {id} is not supported; ignoring");
        }

        if old.ip_size != new.ip_size
            && let (Some(ip_start), Some(size)) = (old.ip_start.as_deref(), new.ip_size)
        {
            plan.add(
                UpdateStep::AddressRange,
                RemoteCall::new(
                    Self::KIND.method("update_ar"),
                    vec![
                        Value::Int(id),
                        Value::from(address_range_update(ip_start, size).to_string()),
                    ],
                ),
            );
        }

        if old.security_groups != new.security_groups {
            plan.add(UpdateStep::SecurityGroups, security_groups_call(id, &new.security_groups));
        }

        plan_access_changes(
            &mut plan,
            (old.uid, old.gid, old.permissions.as_deref()),
            (new.uid, new.gid, new.permissions.as_deref()),
        )?;

        Ok(plan)
    }

    fn requires_replacement(&self, old: &VnetConfig, new: &VnetConfig) -> bool {
        old.reservation_vnet != new.reservation_vnet
            || old.reservation_size != new.reservation_size
            || old.bridge != new.bridge
            || old.hold_size != new.hold_size
    }

    async fn create(
        &self,
        desired: &VnetConfig,
        recorder: &dyn AllocationRecorder,
    ) -> Result<VnetObserved> {
        let id = match desired.reservation_vnet {
            Some(source) => {
                let id = self.reserve(desired, source, recorder).await?;
                self.ctx
                    .apply_ownership(Self::KIND, id, desired.uid, desired.gid)
                    .await?;
                self.ctx
                    .apply_permissions(Self::KIND, id, desired.permissions.as_deref())
                    .await?;
                id
            }
            None => self.allocate(desired, recorder).await?,
        };

        if !desired.security_groups.is_empty() {
            security_groups_call(id, &desired.security_groups)
                .send(self.ctx.session)
                .await?;
            info!("Applied security groups to vnet {id}");
        }

        self.read(Some(id), &desired.name).await?.ok_or_else(|| {
            ReconcileError::NotFound {
                kind: Self::KIND,
                reference: id.to_string(),
            }
            .into()
        })
    }

    async fn read(&self, id: Option<i64>, name: &str) -> Result<Option<VnetObserved>> {
        self.ctx
            .lookup(Self::KIND, id, name, PoolScope::All)
            .await?
            .map(|document| self.project(&document))
            .transpose()
    }

    async fn delete(&self, id: i64, desired: &VnetConfig) -> Result<bool> {
        let Some(observed) = self.read(Some(id), &desired.name).await? else {
            return Ok(false);
        };
        let id = observed.header.id;

        if desired.reservation_vnet.is_none()
            && let Some(ip_start) = desired.ip_start.as_deref()
        {
            let leases = lease_walk(ip_start, desired.hold_size)?;
            self.walk_leases(id, "release", &leases).await?;
        }

        RemoteCall::new(
            Self::KIND.method("delete"),
            vec![Value::Int(id), Value::Bool(false)],
        )
        .send(self.ctx.session)
        .await?;
        info!("Deleted vnet {id}");
        Ok(true)
    }
}

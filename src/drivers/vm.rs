//! Virtual machine driver.
//!
//! A VM is either instantiated from a template or allocated from an inline
//! body, then waited on until it runs. Only ownership and permissions change
//! in place; any other difference replaces the VM.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::VmConfig;
use crate::error::{ReconcileError, Result};
use crate::one::{ObjectHeader, PoolScope, RemoteCall, Value};
use crate::planner::UpdatePlan;
use crate::poller::Classification;
use crate::template::{decode_string_map, encode_string_map, Element, MarkupBuilder};

use super::{
    plan_access_changes, AllocationRecorder, DriverContext, ResourceDriver, ResourceKind,
    ResourceSummary,
};

const STATE_ACTIVE: i64 = 3;
const STATE_DONE: i64 = 6;
const LCM_RUNNING: i64 = 3;
const LCM_BOOT_FAILURE: i64 = 36;

const GENERIC_BOOT_FAILURE: &str = "No error was found";

/// VM lifecycle classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    /// Active and running.
    Running,
    /// Terminated.
    Done,
    /// Boot failed; carries the best-available diagnostic.
    BootFailure(String),
    /// Any other state pair.
    Pending {
        /// Coarse state.
        state: i64,
        /// LCM sub-state.
        lcm: i64,
    },
}

impl VmState {
    /// Classifies a state pair. `user_template` supplies the `ERROR`
    /// diagnostic for boot failures.
    #[must_use]
    pub fn classify(state: i64, lcm: i64, user_template: &BTreeMap<String, String>) -> Self {
        match (state, lcm) {
            (STATE_ACTIVE, LCM_RUNNING) => Self::Running,
            (STATE_DONE, _) => Self::Done,
            (STATE_ACTIVE, LCM_BOOT_FAILURE) => Self::BootFailure(
                user_template
                    .get("ERROR")
                    .filter(|e| !e.is_empty())
                    .cloned()
                    .unwrap_or_else(|| String::from(GENERIC_BOOT_FAILURE)),
            ),
            (state, lcm) => Self::Pending { state, lcm },
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::BootFailure(_) => write!(f, "boot_failure"),
            Self::Pending { state, lcm } => write!(f, "pending ({state}/{lcm})"),
        }
    }
}

impl Classification for VmState {
    fn failure_message(&self) -> Option<String> {
        match self {
            Self::BootFailure(message) => Some(message.clone()),
            _ => None,
        }
    }
}

/// One observed network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicObserved {
    /// Interface index.
    pub nic_id: Option<i64>,
    /// Assigned IP.
    pub ip: String,
    /// MAC address.
    pub mac: String,
    /// NIC model.
    pub model: String,
    /// Attached network.
    pub network_id: Option<i64>,
    /// Comma-separated security group IDs.
    pub security_groups: String,
}

/// Projection of a VM document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmObserved {
    /// Identity, ownership and permissions.
    pub header: ObjectHeader,
    /// Coarse state.
    pub state: i64,
    /// LCM sub-state.
    pub lcm_state: i64,
    /// Network interfaces.
    pub nics: Vec<NicObserved>,
    /// Primary IP (first NIC).
    pub ip: Option<String>,
    /// Free-form user template.
    pub user_template: BTreeMap<String, String>,
}

impl VmObserved {
    /// Returns the lifecycle classification.
    #[must_use]
    pub fn classification(&self) -> VmState {
        VmState::classify(self.state, self.lcm_state, &self.user_template)
    }

    /// Returns true when the VM failed to boot and has to be recreated.
    #[must_use]
    pub const fn needs_replacement(&self) -> bool {
        self.lcm_state == LCM_BOOT_FAILURE
    }
}

fn project_nic(element: &Element) -> Result<NicObserved> {
    Ok(NicObserved {
        nic_id: element.child_i64("NIC_ID")?,
        ip: element.text_or_empty("IP"),
        mac: element.text_or_empty("MAC"),
        model: element.text_or_empty("MODEL"),
        network_id: element.child_i64("NETWORK_ID")?,
        security_groups: element.text_or_empty("SECURITY_GROUPS"),
    })
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

/// Drives virtual machines.
#[derive(Debug, Clone, Copy)]
pub struct VmDriver<'a> {
    ctx: DriverContext<'a>,
}

impl<'a> VmDriver<'a> {
    /// Creates the driver.
    #[must_use]
    pub const fn new(ctx: DriverContext<'a>) -> Self {
        Self { ctx }
    }

    async fn wait(&self, id: i64, target: &VmState) -> Result<VmObserved> {
        self.ctx
            .poller()
            .wait_for(Self::KIND, id, target, || self.refresh(id))
            .await
    }

    async fn refresh(&self, id: i64) -> Result<(VmObserved, VmState)> {
        let observed = self.project(&self.ctx.info(Self::KIND, id).await?)?;
        let state = observed.classification();
        Ok((observed, state))
    }
}

#[async_trait]
impl ResourceDriver for VmDriver<'_> {
    type Desired = VmConfig;
    type Observed = VmObserved;

    const KIND: ResourceKind = ResourceKind::Vm;

    fn context(&self) -> &DriverContext<'_> {
        &self.ctx
    }

    fn desired_name<'d>(&self, desired: &'d VmConfig) -> &'d str {
        desired.name_or_empty()
    }

    fn build_template(&self, desired: &VmConfig) -> Result<String> {
        let mut builder = MarkupBuilder::new();
        builder
            .open("TEMPLATE")
            .leaf_non_empty("NAME", desired.name.as_deref())
            .leaf_opt("VCPU", desired.vcpu)
            .leaf_opt("CPU", desired.cpu)
            .leaf_opt("MEMORY", desired.memory)
            .raw(&encode_string_map("CONTEXT", &desired.context));

        for nic in &desired.nics {
            let groups = join_ids(&nic.security_groups);
            builder
                .open("NIC")
                .leaf_non_empty("IP", nic.ip.as_deref())
                .leaf_non_empty("MODEL", nic.model.as_deref())
                .leaf("NETWORK_ID", nic.network_id)
                .leaf_non_empty("SECURITY_GROUPS", Some(groups.as_str()))
                .close("NIC");
        }

        for disk in &desired.disks {
            builder
                .open("DISK")
                .leaf("IMAGE_ID", disk.image_id)
                .leaf_opt("SIZE", disk.size)
                .leaf_non_empty("TARGET", disk.target.as_deref())
                .leaf_non_empty("DRIVER", disk.driver.as_deref())
                .close("DISK");
        }

        if let Some(graphics) = &desired.graphics {
            builder
                .open("GRAPHICS")
                .leaf("LISTEN", &graphics.listen)
                .leaf("TYPE", &graphics.graphics_type)
                .close("GRAPHICS");
        }

        if let Some(os) = &desired.os {
            builder
                .open("OS")
                .leaf("ARCH", &os.arch)
                .leaf("BOOT", &os.boot)
                .close("OS");
        }

        if let Some(raw) = &desired.raw {
            builder
                .open("RAW")
                .leaf("TYPE", &raw.raw_type)
                .leaf("DATA", &raw.data)
                .close("RAW");
        }

        builder.close("TEMPLATE");
        Ok(builder.finish())
    }

    fn project(&self, document: &Element) -> Result<VmObserved> {
        let nics = document
            .child("TEMPLATE")
            .map(|t| t.children_named("NIC").map(project_nic).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();

        Ok(VmObserved {
            header: ObjectHeader::from_element(document)?,
            state: document.child_i64("STATE")?.unwrap_or_default(),
            lcm_state: document.child_i64("LCM_STATE")?.unwrap_or_default(),
            ip: nics.first().map(|n| n.ip.clone()).filter(|ip| !ip.is_empty()),
            nics,
            user_template: document
                .child("USER_TEMPLATE")
                .map(decode_string_map)
                .unwrap_or_default(),
        })
    }

    fn summarize(&self, observed: &VmObserved) -> ResourceSummary {
        let mut summary = ResourceSummary::from_header(
            Self::KIND,
            &observed.header,
            observed.classification().to_string(),
            observed,
        );
        summary.needs_replacement = observed.needs_replacement();
        summary
    }

    fn plan_update(&self, id: i64, old: &VmConfig, new: &VmConfig) -> Result<UpdatePlan> {
        let mut plan = UpdatePlan::new(Self::KIND, id);
        plan_access_changes(
            &mut plan,
            (old.uid, old.gid, old.permissions.as_deref()),
            (new.uid, new.gid, new.permissions.as_deref()),
        )?;
        Ok(plan)
    }

    fn requires_replacement(&self, old: &VmConfig, new: &VmConfig) -> bool {
        let strip = |c: &VmConfig| VmConfig {
            permissions: None,
            uid: None,
            gid: None,
            ..c.clone()
        };
        strip(old) != strip(new)
    }

    async fn create(
        &self,
        desired: &VmConfig,
        recorder: &dyn AllocationRecorder,
    ) -> Result<VmObserved> {
        let ctx = self.ctx;

        let id = match desired.template_id {
            Some(template_id) => {
                let id = ctx
                    .call_for_id(
                        "one.template.instantiate",
                        vec![
                            Value::Int(template_id),
                            Value::from(desired.name_or_empty()),
                            Value::Bool(false),
                            Value::from(""),
                            Value::Bool(false),
                        ],
                    )
                    .await?;
                info!("Instantiated template {template_id} as VM {id}");
                id
            }
            None => {
                let template = self.build_template(desired)?;
                let id = ctx
                    .call_for_id(
                        &Self::KIND.method("allocate"),
                        vec![Value::from(template), Value::Bool(false)],
                    )
                    .await?;
                info!("Allocated VM {id}");
                id
            }
        };
        recorder.allocated(id).await?;

        let running = self.wait(id, &VmState::Running).await?;

        ctx.apply_ownership(Self::KIND, id, desired.uid, desired.gid).await?;
        ctx.apply_permissions(Self::KIND, id, desired.permissions.as_deref())
            .await?;

        self.read(Some(id), &running.header.name)
            .await?
            .ok_or_else(|| {
                ReconcileError::NotFound {
                    kind: Self::KIND,
                    reference: id.to_string(),
                }
                .into()
            })
    }

    /// A terminated VM still has a readable document; it reads as absent.
    async fn read(&self, id: Option<i64>, name: &str) -> Result<Option<VmObserved>> {
        let Some(document) = self.ctx.lookup(Self::KIND, id, name, PoolScope::Mine).await? else {
            return Ok(None);
        };
        let observed = self.project(&document)?;
        if observed.state == STATE_DONE {
            debug!("VM {} is done", observed.header.id);
            return Ok(None);
        }
        Ok(Some(observed))
    }

    async fn delete(&self, id: i64, desired: &VmConfig) -> Result<bool> {
        let Some(observed) = self.read(Some(id), desired.name_or_empty()).await? else {
            return Ok(false);
        };
        let id = observed.header.id;

        RemoteCall::new(
            Self::KIND.method("action"),
            vec![Value::from("terminate-hard"), Value::Int(id)],
        )
        .send(self.ctx.session)
        .await?;
        info!("Terminated VM {id}");

        self.wait(id, &VmState::Done).await?;
        Ok(true)
    }
}

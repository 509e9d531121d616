//! Resource drivers.
//!
//! One driver per resource kind composes the template builder, identity
//! resolution, the state poller and the update sequencer into full
//! create/read/update/delete flows. [`Drivers`] dispatches a
//! [`ResourceConfig`] to the right one.

mod account;
mod image;
mod secgroup;
mod vm;
mod vnet;

pub use account::{AccountDriver, AccountObserved};
pub use image::{ImageDriver, ImageObserved, ImageState};
pub use secgroup::{SecurityGroupDriver, SecurityGroupObserved};
pub use vm::{NicObserved, VmDriver, VmObserved, VmState};
pub use vnet::{lease_walk, AddressRangeObserved, VnetDriver, VnetObserved};

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ResourceConfig;
use crate::error::{NebulaError, ReconcileError, RemoteError, Result};
use crate::one::{parse_pool, ObjectHeader, PoolEntry, PoolScope, RemoteCall, RemoteSession, Value};
use crate::permissions::Permissions;
use crate::planner::{AppliedSteps, CommitRecorder, NoopRecorder, UpdatePlan, UpdateSequencer};
use crate::poller::{PollConfig, StatePoller};
use crate::resolver::first_match;
use crate::template::{Element, UpdateMode};

/// Kinds of remote objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Disk image.
    Image,
    /// Security group.
    SecurityGroup,
    /// Virtual machine.
    Vm,
    /// Virtual network.
    Vnet,
    /// User account (read-only).
    User,
    /// Group (read-only).
    Group,
}

impl ResourceKind {
    /// Returns the API method prefix, e.g. `one.image`.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Image => "one.image",
            Self::SecurityGroup => "one.secgroup",
            Self::Vm => "one.vm",
            Self::Vnet => "one.vn",
            Self::User => "one.user",
            Self::Group => "one.group",
        }
    }

    /// Returns the full method name for an operation on this kind.
    #[must_use]
    pub fn method(self, operation: &str) -> String {
        format!("{}.{operation}", self.prefix())
    }

    /// Returns the pool listing method, e.g. `one.imagepool.info`.
    #[must_use]
    pub fn pool_method(self) -> String {
        format!("{}pool.info", self.prefix())
    }

    /// Returns the root element of a single object document.
    #[must_use]
    pub const fn document_root(self) -> &'static str {
        match self {
            Self::Image => "IMAGE",
            Self::SecurityGroup => "SECURITY_GROUP",
            Self::Vm => "VM",
            Self::Vnet => "VNET",
            Self::User => "USER",
            Self::Group => "GROUP",
        }
    }

    /// Returns the short label used in state keys and on the command line.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::SecurityGroup => "secgroup",
            Self::Vm => "vm",
            Self::Vnet => "vnet",
            Self::User => "user",
            Self::Group => "group",
        }
    }

    /// Returns the arguments of the `info` call for an ID.
    fn info_args(self, id: i64) -> Vec<Value> {
        match self {
            Self::Image | Self::Vnet | Self::User | Self::Group => {
                vec![Value::Int(id), Value::Bool(false)]
            }
            Self::SecurityGroup | Self::Vm => vec![Value::Int(id)],
        }
    }

    /// Returns the arguments of the pool listing call.
    fn pool_args(self, scope: PoolScope) -> Vec<Value> {
        match self {
            Self::User | Self::Group => vec![Value::Bool(false)],
            _ => vec![Value::Int(scope.flag()), Value::Int(-1), Value::Int(-1)],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Image => "image",
            Self::SecurityGroup => "security group",
            Self::Vm => "vm",
            Self::Vnet => "vnet",
            Self::User => "user",
            Self::Group => "group",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(Self::Image),
            "secgroup" | "security_group" | "security-group" => Ok(Self::SecurityGroup),
            "vm" => Ok(Self::Vm),
            "vnet" | "vn" => Ok(Self::Vnet),
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            other => Err(format!("unknown resource kind '{other}'")),
        }
    }
}

/// Everything a driver needs to talk to the remote side.
#[derive(Clone, Copy)]
pub struct DriverContext<'a> {
    /// Session handle shared by every call.
    pub session: &'a dyn RemoteSession,
    /// Poller timing.
    pub poll: PollConfig,
}

impl fmt::Debug for DriverContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("user", &self.session.username())
            .field("poll", &self.poll)
            .finish()
    }
}

impl<'a> DriverContext<'a> {
    /// Creates a context.
    #[must_use]
    pub const fn new(session: &'a dyn RemoteSession, poll: PollConfig) -> Self {
        Self { session, poll }
    }

    /// Returns a poller with this context's timing.
    #[must_use]
    pub const fn poller(&self) -> StatePoller {
        StatePoller::new(self.poll)
    }

    /// Returns an update sequencer over this context's session.
    #[must_use]
    pub const fn sequencer(&self) -> UpdateSequencer<'a> {
        UpdateSequencer::new(self.session)
    }

    /// Issues one call.
    ///
    /// # Errors
    ///
    /// Returns the session error unchanged.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<String> {
        self.session.call(method, args).await
    }

    /// Issues a call that answers with a new object ID.
    ///
    /// # Errors
    ///
    /// Returns the session error, or an invalid-response error if the payload
    /// is not an ID.
    pub async fn call_for_id(&self, method: &str, args: Vec<Value>) -> Result<i64> {
        let payload = self.call(method, args).await?;
        parse_id(method, &payload)
    }

    /// Fetches and parses one object document.
    ///
    /// # Errors
    ///
    /// Returns the session error or a parse error.
    pub async fn info(&self, kind: ResourceKind, id: i64) -> Result<Element> {
        let payload = self.call(&kind.method("info"), kind.info_args(id)).await?;
        Element::parse(&payload)
    }

    /// Lists a pool.
    ///
    /// # Errors
    ///
    /// Returns the session error or a parse error.
    pub async fn pool(&self, kind: ResourceKind, scope: PoolScope) -> Result<Vec<PoolEntry>> {
        let payload = self.call(&kind.pool_method(), kind.pool_args(scope)).await?;
        let pool = parse_pool(&payload, kind.document_root())?;
        debug!("Listed {} {kind} entries", pool.len());
        Ok(pool)
    }

    /// Finds an object by ID, falling back to the first pool entry named
    /// `name`.
    ///
    /// Returns `None` when neither finds it, which callers treat as "absent".
    /// A failed `info` by ID only falls back when the API reported a missing
    /// object; transport and authorization errors propagate.
    ///
    /// # Errors
    ///
    /// Returns transport errors and malformed documents.
    pub async fn lookup(
        &self,
        kind: ResourceKind,
        id: Option<i64>,
        name: &str,
        scope: PoolScope,
    ) -> Result<Option<Element>> {
        if let Some(id) = id {
            match self.info(kind, id).await {
                Ok(document) => return Ok(Some(document)),
                Err(e) if e.is_not_found() => debug!("Could not find {kind} by ID {id}: {e}"),
                Err(e) => return Err(e),
            }
        }

        if name.is_empty() {
            return Ok(None);
        }

        let pool = self.pool(kind, scope).await?;
        match first_match(&pool, name) {
            Some(found) => self.info(kind, found).await.map(Some),
            None => {
                info!(
                    "Could not find {kind} named '{name}' for user {}",
                    self.session.username()
                );
                Ok(None)
            }
        }
    }

    /// Applies owner/group if either is requested.
    ///
    /// # Errors
    ///
    /// Returns the session error.
    pub async fn apply_ownership(
        &self,
        kind: ResourceKind,
        id: i64,
        uid: Option<i64>,
        gid: Option<i64>,
    ) -> Result<()> {
        if let Some(call) = chown_call(kind, id, uid, gid) {
            call.send(self.session).await?;
            info!("Changed ownership of {kind} {id}");
        }
        Ok(())
    }

    /// Applies a permission string if one is requested.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed string, or the session error.
    pub async fn apply_permissions(
        &self,
        kind: ResourceKind,
        id: i64,
        permissions: Option<&str>,
    ) -> Result<()> {
        if let Some(permissions) = permissions.filter(|p| !p.is_empty()) {
            chmod_call(kind, id, permissions)?.send(self.session).await?;
            info!("Set permissions {permissions} on {kind} {id}");
        }
        Ok(())
    }
}

/// Builds a `chmod` call.
///
/// # Errors
///
/// Returns a validation error for a malformed permission string.
pub fn chmod_call(kind: ResourceKind, id: i64, permissions: &str) -> Result<RemoteCall> {
    let mut args = vec![Value::Int(id)];
    args.extend(Permissions::encode(permissions)?.chmod_args());
    Ok(RemoteCall::new(kind.method("chmod"), args))
}

/// Builds a `chown` call; `-1` leaves the owner or group unchanged.
#[must_use]
pub fn chown_call(
    kind: ResourceKind,
    id: i64,
    uid: Option<i64>,
    gid: Option<i64>,
) -> Option<RemoteCall> {
    if uid.is_none() && gid.is_none() {
        return None;
    }
    Some(RemoteCall::new(
        kind.method("chown"),
        vec![
            Value::Int(id),
            Value::Int(uid.unwrap_or(-1)),
            Value::Int(gid.unwrap_or(-1)),
        ],
    ))
}

/// Builds a `rename` call.
#[must_use]
pub fn rename_call(kind: ResourceKind, id: i64, name: &str) -> RemoteCall {
    RemoteCall::new(kind.method("rename"), vec![Value::Int(id), Value::from(name)])
}

/// Builds an `update` call.
#[must_use]
pub fn update_call(kind: ResourceKind, id: i64, body: &str, mode: UpdateMode) -> RemoteCall {
    RemoteCall::new(
        kind.method("update"),
        vec![Value::Int(id), Value::from(body), mode.into()],
    )
}

/// Adds ownership and permission steps common to every kind.
///
/// # Errors
///
/// Returns a validation error for a malformed permission string.
pub fn plan_access_changes(
    plan: &mut UpdatePlan,
    old: (Option<i64>, Option<i64>, Option<&str>),
    new: (Option<i64>, Option<i64>, Option<&str>),
) -> Result<()> {
    use crate::planner::UpdateStep;

    let (old_uid, old_gid, old_perms) = old;
    let (new_uid, new_gid, new_perms) = new;

    if (old_uid, old_gid) != (new_uid, new_gid)
        && let Some(call) = chown_call(plan.kind, plan.id, new_uid, new_gid)
    {
        plan.add(UpdateStep::Ownership, call);
    }

    if old_perms != new_perms
        && let Some(perms) = new_perms.filter(|p| !p.is_empty())
    {
        plan.add(UpdateStep::Permissions, chmod_call(plan.kind, plan.id, perms)?);
    }

    Ok(())
}

/// Parses an ID payload.
///
/// # Errors
///
/// Returns an invalid-response error if the payload is not an integer.
pub fn parse_id(method: &str, payload: &str) -> Result<i64> {
    payload.trim().parse().map_err(|_| {
        RemoteError::invalid(format!("{method} returned '{payload}' instead of an ID")).into()
    })
}

/// Projected view of any remote object, for reporting and the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Numeric ID.
    pub id: i64,
    /// Remote name.
    pub name: String,
    /// Owner user name.
    pub uname: String,
    /// Owner group name.
    pub gname: String,
    /// Permission string, when known.
    pub permissions: Option<String>,
    /// Human-readable lifecycle state.
    pub status: String,
    /// The object is in a state it cannot leave and must be recreated.
    #[serde(default)]
    pub needs_replacement: bool,
    /// Full kind-specific projection.
    pub attributes: serde_json::Value,
}

impl ResourceSummary {
    /// Builds a summary from a header and a kind-specific projection.
    #[must_use]
    pub fn from_header<T: Serialize>(
        kind: ResourceKind,
        header: &ObjectHeader,
        status: impl Into<String>,
        observed: &T,
    ) -> Self {
        Self {
            kind,
            id: header.id,
            name: header.name.clone(),
            uname: header.ownership.uname.clone(),
            gname: header.ownership.gname.clone(),
            permissions: header.permissions.clone(),
            status: status.into(),
            needs_replacement: false,
            attributes: serde_json::to_value(observed).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Learns the ID of a new object as soon as the remote side assigns it,
/// before the driver waits for the object to settle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AllocationRecorder: Send + Sync {
    /// Persists the ID of an object that exists but is not ready yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID cannot be stored. The driver stops before
    /// any further call.
    async fn allocated(&self, id: i64) -> Result<()>;
}

#[async_trait]
impl AllocationRecorder for NoopRecorder {
    async fn allocated(&self, _id: i64) -> Result<()> {
        Ok(())
    }
}

/// Full lifecycle of one resource kind.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// Desired configuration record.
    type Desired: Send + Sync;
    /// Projection of the remote document.
    type Observed: Send + Sync + Serialize;

    /// Kind handled by this driver.
    const KIND: ResourceKind;

    /// Returns the driver context.
    fn context(&self) -> &DriverContext<'_>;

    /// Returns the declared name of a record.
    fn desired_name<'d>(&self, desired: &'d Self::Desired) -> &'d str;

    /// Renders the allocate payload.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the record cannot be expressed.
    fn build_template(&self, desired: &Self::Desired) -> Result<String>;

    /// Projects a remote document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed.
    fn project(&self, document: &Element) -> Result<Self::Observed>;

    /// Summarizes an observation.
    fn summarize(&self, observed: &Self::Observed) -> ResourceSummary;

    /// Plans the steps turning `old` into `new` on object `id`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed values.
    fn plan_update(&self, id: i64, old: &Self::Desired, new: &Self::Desired) -> Result<UpdatePlan>;

    /// Returns true when `old` cannot be turned into `new` in place.
    fn requires_replacement(&self, _old: &Self::Desired, _new: &Self::Desired) -> bool {
        false
    }

    /// Creates the object and returns its settled projection.
    ///
    /// `recorder` hears the new ID right after the allocating call, so a
    /// failure while settling leaves a known object behind.
    ///
    /// # Errors
    ///
    /// Returns remote, wait and validation errors.
    async fn create(
        &self,
        desired: &Self::Desired,
        recorder: &dyn AllocationRecorder,
    ) -> Result<Self::Observed>;

    /// Reads an object by ID, falling back to its name. `None` means absent.
    ///
    /// # Errors
    ///
    /// Returns transport errors and malformed documents.
    async fn read(&self, id: Option<i64>, name: &str) -> Result<Option<Self::Observed>>;

    /// Returns true if the object exists.
    ///
    /// # Errors
    ///
    /// Returns the read error.
    async fn exists(&self, id: Option<i64>, name: &str) -> Result<bool> {
        Ok(self.read(id, name).await?.is_some())
    }

    /// Applies the difference between two records through the update
    /// sequencer and returns the new projection.
    ///
    /// # Errors
    ///
    /// Returns a partial-update error naming the first incomplete step, or
    /// [`ReconcileError::NotFound`] if the object vanished afterwards.
    async fn update(
        &self,
        id: i64,
        old: &Self::Desired,
        new: &Self::Desired,
        applied: &mut AppliedSteps,
        recorder: &dyn CommitRecorder,
    ) -> Result<Self::Observed> {
        let plan = self.plan_update(id, old, new)?;
        self.context()
            .sequencer()
            .run(&plan, applied, recorder)
            .await?;

        self.read(Some(id), self.desired_name(new))
            .await?
            .ok_or_else(|| {
                ReconcileError::NotFound {
                    kind: Self::KIND,
                    reference: id.to_string(),
                }
                .into()
            })
    }

    /// Deletes the object. Returns false when it was already gone.
    ///
    /// # Errors
    ///
    /// Returns remote and wait errors.
    async fn delete(&self, id: i64, desired: &Self::Desired) -> Result<bool>;
}

/// Dispatches configured resources to their drivers.
#[derive(Debug, Clone, Copy)]
pub struct Drivers<'a> {
    images: ImageDriver<'a>,
    security_groups: SecurityGroupDriver<'a>,
    vms: VmDriver<'a>,
    vnets: VnetDriver<'a>,
    accounts: AccountDriver<'a>,
}

impl<'a> Drivers<'a> {
    /// Creates the dispatcher.
    #[must_use]
    pub const fn new(ctx: DriverContext<'a>) -> Self {
        Self {
            images: ImageDriver::new(ctx),
            security_groups: SecurityGroupDriver::new(ctx),
            vms: VmDriver::new(ctx),
            vnets: VnetDriver::new(ctx),
            accounts: AccountDriver::new(ctx),
        }
    }

    /// Creates a configured resource.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn create(
        &self,
        config: &ResourceConfig,
        recorder: &dyn AllocationRecorder,
    ) -> Result<ResourceSummary> {
        Ok(match config {
            ResourceConfig::Image(c) => {
                self.images.summarize(&self.images.create(c, recorder).await?)
            }
            ResourceConfig::SecurityGroup(c) => self
                .security_groups
                .summarize(&self.security_groups.create(c, recorder).await?),
            ResourceConfig::Vm(c) => self.vms.summarize(&self.vms.create(c, recorder).await?),
            ResourceConfig::Vnet(c) => {
                self.vnets.summarize(&self.vnets.create(c, recorder).await?)
            }
        })
    }

    /// Reads a configured resource by ID, falling back to `name`.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn read(
        &self,
        kind: ResourceKind,
        id: Option<i64>,
        name: &str,
    ) -> Result<Option<ResourceSummary>> {
        Ok(match kind {
            ResourceKind::Image => self
                .images
                .read(id, name)
                .await?
                .map(|o| self.images.summarize(&o)),
            ResourceKind::SecurityGroup => self
                .security_groups
                .read(id, name)
                .await?
                .map(|o| self.security_groups.summarize(&o)),
            ResourceKind::Vm => self.vms.read(id, name).await?.map(|o| self.vms.summarize(&o)),
            ResourceKind::Vnet => self
                .vnets
                .read(id, name)
                .await?
                .map(|o| self.vnets.summarize(&o)),
            ResourceKind::User | ResourceKind::Group => {
                let reference = id.map_or_else(|| name.to_string(), |id| id.to_string());
                self.accounts
                    .read(kind, &reference)
                    .await?
                    .map(|o| o.summary(kind))
            }
        })
    }

    /// Reads any kind by a user-supplied reference (ID or name).
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn read_reference(
        &self,
        kind: ResourceKind,
        reference: &str,
    ) -> Result<Option<ResourceSummary>> {
        match reference.trim().parse::<i64>() {
            Ok(id) => self.read(kind, Some(id), "").await,
            Err(_) => self.read(kind, None, reference).await,
        }
    }

    /// Returns true when `old` cannot be turned into `new` in place.
    #[must_use]
    pub fn requires_replacement(&self, old: &ResourceConfig, new: &ResourceConfig) -> bool {
        match (old, new) {
            (ResourceConfig::Image(o), ResourceConfig::Image(n)) => {
                self.images.requires_replacement(o, n)
            }
            (ResourceConfig::SecurityGroup(o), ResourceConfig::SecurityGroup(n)) => {
                self.security_groups.requires_replacement(o, n)
            }
            (ResourceConfig::Vm(o), ResourceConfig::Vm(n)) => self.vms.requires_replacement(o, n),
            (ResourceConfig::Vnet(o), ResourceConfig::Vnet(n)) => {
                self.vnets.requires_replacement(o, n)
            }
            _ => true,
        }
    }

    /// Plans an in-place update without running it.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the kinds differ, or the driver error.
    pub fn plan_update(
        &self,
        id: i64,
        old: &ResourceConfig,
        new: &ResourceConfig,
    ) -> Result<UpdatePlan> {
        match (old, new) {
            (ResourceConfig::Image(o), ResourceConfig::Image(n)) => self.images.plan_update(id, o, n),
            (ResourceConfig::SecurityGroup(o), ResourceConfig::SecurityGroup(n)) => {
                self.security_groups.plan_update(id, o, n)
            }
            (ResourceConfig::Vm(o), ResourceConfig::Vm(n)) => self.vms.plan_update(id, o, n),
            (ResourceConfig::Vnet(o), ResourceConfig::Vnet(n)) => self.vnets.plan_update(id, o, n),
            _ => Err(kind_mismatch(old, new)),
        }
    }

    /// Updates a resource in place.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the kinds differ, or the driver error.
    pub async fn update(
        &self,
        id: i64,
        old: &ResourceConfig,
        new: &ResourceConfig,
        applied: &mut AppliedSteps,
        recorder: &dyn CommitRecorder,
    ) -> Result<ResourceSummary> {
        Ok(match (old, new) {
            (ResourceConfig::Image(o), ResourceConfig::Image(n)) => {
                let observed = self.images.update(id, o, n, applied, recorder).await?;
                self.images.summarize(&observed)
            }
            (ResourceConfig::SecurityGroup(o), ResourceConfig::SecurityGroup(n)) => {
                let observed = self
                    .security_groups
                    .update(id, o, n, applied, recorder)
                    .await?;
                self.security_groups.summarize(&observed)
            }
            (ResourceConfig::Vm(o), ResourceConfig::Vm(n)) => {
                let observed = self.vms.update(id, o, n, applied, recorder).await?;
                self.vms.summarize(&observed)
            }
            (ResourceConfig::Vnet(o), ResourceConfig::Vnet(n)) => {
                let observed = self.vnets.update(id, o, n, applied, recorder).await?;
                self.vnets.summarize(&observed)
            }
            _ => return Err(kind_mismatch(old, new)),
        })
    }

    /// Deletes a resource. Returns false when it was already gone.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn delete(&self, id: i64, config: &ResourceConfig) -> Result<bool> {
        match config {
            ResourceConfig::Image(c) => self.images.delete(id, c).await,
            ResourceConfig::SecurityGroup(c) => self.security_groups.delete(id, c).await,
            ResourceConfig::Vm(c) => self.vms.delete(id, c).await,
            ResourceConfig::Vnet(c) => self.vnets.delete(id, c).await,
        }
    }
}

fn kind_mismatch(old: &ResourceConfig, new: &ResourceConfig) -> NebulaError {
    NebulaError::internal(format!(
        "cannot update a {} into a {}",
        old.kind(),
        new.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::one::testing::ScriptedSession;
    use std::time::Duration;

    pub(super) fn context(session: &ScriptedSession) -> DriverContext<'_> {
        DriverContext::new(session, PollConfig::immediate(Duration::from_secs(2)))
    }

    #[test]
    fn test_method_names() {
        assert_eq!(ResourceKind::Vnet.method("add_ar"), "one.vn.add_ar");
        assert_eq!(ResourceKind::SecurityGroup.pool_method(), "one.secgrouppool.info");
        assert_eq!(ResourceKind::User.pool_method(), "one.userpool.info");
    }

    #[test]
    fn test_kind_parse_and_display() {
        assert_eq!("secgroup".parse::<ResourceKind>(), Ok(ResourceKind::SecurityGroup));
        assert_eq!(ResourceKind::SecurityGroup.to_string(), "security group");
        assert!("volume".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_chown_leaves_unset_side_unchanged() {
        assert!(chown_call(ResourceKind::Image, 1, None, None).is_none());
        let call = chown_call(ResourceKind::Image, 1, None, Some(100)).expect("call");
        assert_eq!(call.args, vec![Value::Int(1), Value::Int(-1), Value::Int(100)]);
    }

    #[test]
    fn test_chmod_rejects_bad_permissions() {
        assert!(chmod_call(ResourceKind::Vm, 1, "999").is_err());
        assert_eq!(chmod_call(ResourceKind::Vm, 1, "600").expect("call").args.len(), 10);
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_first_named_entry() {
        let session = ScriptedSession::new();
        session
            .fault("one.vn.info", "[one.vn.info] Error getting virtual network [3].")
            .ok("one.vn.info", "<VNET><ID>21</ID><NAME>private</NAME></VNET>");
        session.ok(
            "one.vnpool.info",
            "<VNET_POOL><VNET><ID>21</ID><NAME>private</NAME></VNET>\
             <VNET><ID>22</ID><NAME>private</NAME></VNET></VNET_POOL>",
        );

        let doc = context(&session)
            .lookup(ResourceKind::Vnet, Some(3), "private", PoolScope::All)
            .await
            .expect("lookup failed")
            .expect("found");

        assert_eq!(doc.child_i64("ID").expect("id"), Some(21));
        let pool_call = &session.calls_to("one.vnpool.info")[0];
        assert_eq!(pool_call.args, vec![Value::Int(-2), Value::Int(-1), Value::Int(-1)]);
        assert_eq!(
            session.calls_to("one.vn.info")[1].args,
            vec![Value::Int(21), Value::Bool(false)]
        );
    }

    #[tokio::test]
    async fn test_lookup_propagates_transport_errors() {
        let session = ScriptedSession::new();
        session.network_error("one.vm.info", "connection reset");

        let result = context(&session)
            .lookup(ResourceKind::Vm, Some(3), "web", PoolScope::Mine)
            .await;

        assert!(result.is_err());
        assert!(session.calls_to("one.vmpool.info").is_empty());
    }

    #[tokio::test]
    async fn test_lookup_propagates_authorization_faults() {
        let session = ScriptedSession::new();
        session.denied("one.vm.info", "[one.vm.info] User [3] : Not authorized");

        let result = context(&session)
            .lookup(ResourceKind::Vm, Some(3), "web", PoolScope::Mine)
            .await;

        assert!(matches!(result, Err(e) if !e.is_not_found()));
        assert!(session.calls_to("one.vmpool.info").is_empty());
    }

    #[tokio::test]
    async fn test_lookup_absent_name_is_none() {
        let session = ScriptedSession::new();
        session.ok("one.imagepool.info", "<IMAGE_POOL/>");

        let found = context(&session)
            .lookup(ResourceKind::Image, None, "missing", PoolScope::All)
            .await
            .expect("lookup failed");

        assert!(found.is_none());
    }
}

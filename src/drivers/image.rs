//! Image driver.
//!
//! Images are allocated from a template or cloned from another image, then
//! waited on until the datastore copy finishes (`STATE` 1). Deletion waits
//! until the image can no longer be read.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ImageConfig, ImageType};
use crate::error::{ReconcileError, Result};
use crate::one::{ObjectHeader, PoolScope, RemoteCall, Value};
use crate::planner::{UpdatePlan, UpdateStep};
use crate::poller::Classification;
use crate::resolver::resolve;
use crate::template::{AttributeTemplate, Element, MarkupBuilder, UpdateMode};

use super::{
    plan_access_changes, rename_call, update_call, AllocationRecorder, DriverContext,
    ResourceDriver, ResourceKind, ResourceSummary,
};

const STATE_READY: i64 = 1;
const STATE_ERROR: i64 = 5;

/// Image lifecycle classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageState {
    /// Copy finished, image usable.
    Ready,
    /// The datastore reported an error.
    Error,
    /// The image cannot be read.
    NotFound,
    /// Any other lifecycle code.
    Pending(i64),
}

impl ImageState {
    /// Classifies a lifecycle code.
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            STATE_READY => Self::Ready,
            STATE_ERROR => Self::Error,
            other => Self::Pending(other),
        }
    }
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
            Self::NotFound => write!(f, "notfound"),
            Self::Pending(code) => write!(f, "pending ({code})"),
        }
    }
}

impl Classification for ImageState {
    fn failure_message(&self) -> Option<String> {
        matches!(self, Self::Error).then(|| String::from("image entered error state"))
    }
}

/// Projection of an image document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageObserved {
    /// Identity, ownership and permissions.
    pub header: ObjectHeader,
    /// Lifecycle code.
    pub state: i64,
    /// Image type, when the code is known.
    pub image_type: Option<ImageType>,
    /// Size in MB.
    pub size: Option<i64>,
    /// Source path.
    pub path: String,
    /// Persistent flag.
    pub persistent: bool,
    /// Device prefix.
    pub dev_prefix: String,
    /// Disk driver.
    pub driver: String,
    /// Description.
    pub description: String,
}

impl ImageObserved {
    /// Returns the lifecycle classification.
    #[must_use]
    pub const fn classification(&self) -> ImageState {
        ImageState::from_code(self.state)
    }
}

/// Drives images.
#[derive(Debug, Clone, Copy)]
pub struct ImageDriver<'a> {
    ctx: DriverContext<'a>,
}

impl<'a> ImageDriver<'a> {
    /// Creates the driver.
    #[must_use]
    pub const fn new(ctx: DriverContext<'a>) -> Self {
        Self { ctx }
    }

    /// Waits until image `id` reaches `target`.
    async fn wait(&self, id: i64, target: &ImageState) -> Result<()> {
        self.ctx
            .poller()
            .wait_for(Self::KIND, id, target, || self.refresh(id))
            .await
    }

    async fn refresh(&self, id: i64) -> Result<((), ImageState)> {
        match self.ctx.info(Self::KIND, id).await {
            Ok(document) => {
                let state = document.require_i64("STATE")?;
                Ok(((), ImageState::from_code(state)))
            }
            Err(e) if e.is_not_found() => {
                debug!("Image {id} was not found: {e}");
                Ok(((), ImageState::NotFound))
            }
            Err(e) => Err(e),
        }
    }

    async fn clone_from(&self, source: &str, desired: &ImageConfig) -> Result<i64> {
        let ctx = self.ctx;
        let source_id = resolve(source, Self::KIND, || ctx.pool(Self::KIND, PoolScope::Mine)).await?;

        let id = ctx
            .call_for_id(
                &Self::KIND.method("clone"),
                vec![
                    Value::Int(source_id),
                    Value::from(desired.name.as_str()),
                    Value::Int(desired.datastore_id),
                ],
            )
            .await?;
        info!("Cloned image {source_id} into image {id} '{}'", desired.name);
        Ok(id)
    }
}

/// Renders the replace-mode body used for description updates.
fn update_body(desired: &ImageConfig) -> String {
    AttributeTemplate::new()
        .with_opt("DESCRIPTION", desired.description.as_deref())
        .with_opt("DEV_PREFIX", desired.dev_prefix.as_deref())
        .with_opt("DRIVER", desired.driver.as_deref())
        .to_string()
}

#[async_trait]
impl ResourceDriver for ImageDriver<'_> {
    type Desired = ImageConfig;
    type Observed = ImageObserved;

    const KIND: ResourceKind = ResourceKind::Image;

    fn context(&self) -> &DriverContext<'_> {
        &self.ctx
    }

    fn desired_name<'d>(&self, desired: &'d ImageConfig) -> &'d str {
        &desired.name
    }

    fn build_template(&self, desired: &ImageConfig) -> Result<String> {
        let mut builder = MarkupBuilder::new();
        builder
            .open("IMAGE")
            .leaf("NAME", &desired.name)
            .leaf_non_empty("DESCRIPTION", desired.description.as_deref())
            .leaf_opt("SIZE", desired.size)
            .leaf_non_empty("PATH", desired.path.as_deref())
            .leaf("PERSISTENT", if desired.persistent { "YES" } else { "NO" })
            .leaf_opt("TYPE", desired.image_type)
            .leaf_non_empty("DEV_PREFIX", desired.dev_prefix.as_deref())
            .leaf_non_empty("TARGET", desired.target.as_deref())
            .leaf_non_empty("DRIVER", desired.driver.as_deref())
            .leaf_non_empty("FORMAT", desired.format.as_deref())
            .leaf_non_empty("MD5", desired.md5.as_deref())
            .leaf_non_empty("SHA1", desired.sha1.as_deref())
            .close("IMAGE");
        Ok(builder.finish())
    }

    fn project(&self, document: &Element) -> Result<ImageObserved> {
        let template = document.child("TEMPLATE");
        let from_template = |key: &str| template.map(|t| t.text_or_empty(key)).unwrap_or_default();

        Ok(ImageObserved {
            header: ObjectHeader::from_element(document)?,
            state: document.child_i64("STATE")?.unwrap_or_default(),
            image_type: document.child_i64("TYPE")?.and_then(ImageType::from_code),
            size: document.child_i64("SIZE")?,
            path: document.text_or_empty("PATH"),
            persistent: document.child_i64("PERSISTENT")?.is_some_and(|p| p != 0),
            dev_prefix: from_template("DEV_PREFIX"),
            driver: from_template("DRIVER"),
            description: from_template("DESCRIPTION"),
        })
    }

    fn summarize(&self, observed: &ImageObserved) -> ResourceSummary {
        ResourceSummary::from_header(
            Self::KIND,
            &observed.header,
            observed.classification().to_string(),
            observed,
        )
    }

    fn plan_update(&self, id: i64, old: &ImageConfig, new: &ImageConfig) -> Result<UpdatePlan> {
        let mut plan = UpdatePlan::new(Self::KIND, id);

        if old.description != new.description {
            plan.add(
                UpdateStep::Body,
                update_call(Self::KIND, id, &update_body(new), UpdateMode::Replace),
            );
        }

        if old.name != new.name {
            plan.add(UpdateStep::Rename, rename_call(Self::KIND, id, &new.name));
        }

        plan_access_changes(
            &mut plan,
            (old.uid, old.gid, old.permissions.as_deref()),
            (new.uid, new.gid, new.permissions.as_deref()),
        )?;

        Ok(plan)
    }

    fn requires_replacement(&self, old: &ImageConfig, new: &ImageConfig) -> bool {
        old.clone_from_image != new.clone_from_image
            || old.datastore_id != new.datastore_id
            || old.persistent != new.persistent
            || old.path != new.path
            || old.image_type != new.image_type
            || old.size != new.size
            || old.dev_prefix != new.dev_prefix
            || old.driver != new.driver
            || old.target != new.target
            || old.format != new.format
            || old.md5 != new.md5
            || old.sha1 != new.sha1
    }

    async fn create(
        &self,
        desired: &ImageConfig,
        recorder: &dyn AllocationRecorder,
    ) -> Result<ImageObserved> {
        let ctx = self.ctx;

        let id = match desired.clone_from_image.as_deref().filter(|s| !s.is_empty()) {
            Some(source) => self.clone_from(source, desired).await?,
            None => {
                let template = self.build_template(desired)?;
                let id = ctx
                    .call_for_id(
                        &Self::KIND.method("allocate"),
                        vec![Value::from(template), Value::Int(desired.datastore_id)],
                    )
                    .await?;
                info!("Allocated image {id} '{}'", desired.name);
                id
            }
        };
        recorder.allocated(id).await?;

        self.wait(id, &ImageState::Ready).await?;

        ctx.apply_ownership(Self::KIND, id, desired.uid, desired.gid).await?;
        ctx.apply_permissions(Self::KIND, id, desired.permissions.as_deref())
            .await?;

        if desired.clone_from_image.as_deref().is_some_and(|s| !s.is_empty()) {
            RemoteCall::new(
                Self::KIND.method("persistent"),
                vec![Value::Int(id), Value::Bool(desired.persistent)],
            )
            .send(ctx.session)
            .await?;
            debug!("Set persistent={} on image {id}", desired.persistent);
        }

        self.read(Some(id), &desired.name).await?.ok_or_else(|| {
            ReconcileError::NotFound {
                kind: Self::KIND,
                reference: id.to_string(),
            }
            .into()
        })
    }

    async fn read(&self, id: Option<i64>, name: &str) -> Result<Option<ImageObserved>> {
        self.ctx
            .lookup(Self::KIND, id, name, PoolScope::All)
            .await?
            .map(|document| self.project(&document))
            .transpose()
    }

    async fn delete(&self, id: i64, desired: &ImageConfig) -> Result<bool> {
        let Some(observed) = self.read(Some(id), &desired.name).await? else {
            return Ok(false);
        };
        let id = observed.header.id;

        RemoteCall::new(
            Self::KIND.method("delete"),
            vec![Value::Int(id), Value::Bool(false)],
        )
        .send(self.ctx.session)
        .await?;
        info!("Deleted image {id}");

        self.wait(id, &ImageState::NotFound).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::tests::context;
    use crate::drivers::MockAllocationRecorder;
    use crate::error::{NebulaError, WaitError};
    use crate::one::testing::ScriptedSession;
    use crate::planner::NoopRecorder;

    fn config() -> ImageConfig {
        ImageConfig {
            name: String::from("base"),
            description: Some(String::from("Base image")),
            permissions: Some(String::from("640")),
            uid: None,
            gid: None,
            clone_from_image: None,
            datastore_id: 1,
            persistent: true,
            path: Some(String::from("http://example.com/base.qcow2")),
            image_type: Some(ImageType::Os),
            size: None,
            dev_prefix: Some(String::from("vd")),
            driver: None,
            target: None,
            format: None,
            md5: None,
            sha1: None,
        }
    }

    fn document(id: i64, state: i64) -> String {
        format!(
            "<IMAGE><ID>{id}</ID><UID>0</UID><GID>0</GID><UNAME>oneadmin</UNAME>\
             <GNAME>oneadmin</GNAME><NAME>base</NAME><STATE>{state}</STATE><TYPE>0</TYPE>\
             <PERSISTENT>1</PERSISTENT><SIZE>2048</SIZE><PATH>/tmp/base</PATH>\
             <TEMPLATE><DEV_PREFIX>vd</DEV_PREFIX><DESCRIPTION>Base image</DESCRIPTION></TEMPLATE></IMAGE>"
        )
    }

    #[test]
    fn test_template_omits_absent_fields() {
        let session = ScriptedSession::new();
        let driver = ImageDriver::new(context(&session));

        let template = driver.build_template(&config()).expect("template");
        assert_eq!(
            template,
            "<IMAGE><NAME>base</NAME><DESCRIPTION>Base image</DESCRIPTION>\
             <PATH>http://example.com/base.qcow2</PATH><PERSISTENT>YES</PERSISTENT>\
             <TYPE>OS</TYPE><DEV_PREFIX>vd</DEV_PREFIX></IMAGE>"
        );
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(ImageState::from_code(1), ImageState::Ready);
        assert_eq!(ImageState::from_code(5), ImageState::Error);
        assert_eq!(ImageState::from_code(4), ImageState::Pending(4));
        assert!(ImageState::Error.failure_message().is_some());
        assert!(ImageState::NotFound.failure_message().is_none());
    }

    #[tokio::test]
    async fn test_create_allocates_waits_then_chmods() {
        let session = ScriptedSession::new();
        session.ok("one.image.allocate", "7");
        session
            .ok("one.image.info", document(7, 4))
            .ok("one.image.info", document(7, 1));

        let observed = ImageDriver::new(context(&session))
            .create(&config(), &NoopRecorder)
            .await
            .expect("create failed");

        assert_eq!(observed.header.id, 7);
        assert_eq!(observed.image_type, Some(ImageType::Os));
        assert!(observed.persistent);
        assert_eq!(
            session.methods(),
            vec![
                "one.image.allocate",
                "one.image.info",
                "one.image.info",
                "one.image.chmod",
                "one.image.info",
            ]
        );
        assert_eq!(
            session.calls_to("one.image.allocate")[0].args[1],
            Value::Int(1)
        );
    }

    #[tokio::test]
    async fn test_error_state_fails_the_wait() {
        let session = ScriptedSession::new();
        session.ok("one.image.allocate", "7");
        session.ok("one.image.info", document(7, 5));
        let mut recorder = MockAllocationRecorder::new();
        recorder
            .expect_allocated()
            .with(mockall::predicate::eq(7))
            .times(1)
            .returning(|_| Ok(()));

        let result = ImageDriver::new(context(&session)).create(&config(), &recorder).await;

        assert!(matches!(
            result,
            Err(NebulaError::Wait(WaitError::Failed { id: 7, .. }))
        ));
        assert!(session.calls_to("one.image.chmod").is_empty());
    }

    #[tokio::test]
    async fn test_unrecorded_allocation_stops_before_waiting() {
        let session = ScriptedSession::new();
        session.ok("one.image.allocate", "7");
        let mut recorder = MockAllocationRecorder::new();
        recorder
            .expect_allocated()
            .returning(|_| Err(NebulaError::internal("disk full")));

        let result = ImageDriver::new(context(&session)).create(&config(), &recorder).await;

        assert!(matches!(result, Err(NebulaError::Internal(_))));
        assert!(session.calls_to("one.image.info").is_empty());
    }

    #[tokio::test]
    async fn test_clone_resolves_source_in_own_pool_and_sets_persistence() {
        let session = ScriptedSession::new();
        session.ok(
            "one.imagepool.info",
            "<IMAGE_POOL><IMAGE><ID>3</ID><NAME>golden</NAME></IMAGE></IMAGE_POOL>",
        );
        session.ok("one.image.clone", "9");
        session.ok("one.image.info", document(9, 1));

        let desired = ImageConfig {
            clone_from_image: Some(String::from("golden")),
            permissions: None,
            ..config()
        };
        ImageDriver::new(context(&session))
            .create(&desired, &NoopRecorder)
            .await
            .expect("clone failed");

        let pool = &session.calls_to("one.imagepool.info")[0];
        assert_eq!(pool.args[0], Value::Int(-3));
        assert_eq!(
            session.calls_to("one.image.clone")[0].args,
            vec![Value::Int(3), Value::from("base"), Value::Int(1)]
        );
        assert_eq!(
            session.calls_to("one.image.persistent")[0].args,
            vec![Value::Int(9), Value::Bool(true)]
        );
    }

    #[tokio::test]
    async fn test_clone_from_unknown_source_is_a_hard_failure() {
        let session = ScriptedSession::new();
        session.ok("one.imagepool.info", "<IMAGE_POOL/>");

        let desired = ImageConfig {
            clone_from_image: Some(String::from("missing")),
            ..config()
        };
        let result = ImageDriver::new(context(&session)).create(&desired, &NoopRecorder).await;

        assert!(matches!(
            result,
            Err(NebulaError::Reconcile(ReconcileError::NotFound { .. }))
        ));
        assert_eq!(session.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_update_orders_description_rename_chmod() {
        let session = ScriptedSession::new();
        session.ok("one.image.info", document(7, 1));

        let old = config();
        let new = ImageConfig {
            permissions: Some(String::from("600")),
            name: String::from("base-v2"),
            description: Some(String::from("Renamed")),
            ..config()
        };
        ImageDriver::new(context(&session))
            .update(7, &old, &new, &mut Default::default(), &NoopRecorder)
            .await
            .expect("update failed");

        assert_eq!(
            session.methods(),
            vec!["one.image.update", "one.image.rename", "one.image.chmod", "one.image.info"]
        );
        assert_eq!(
            session.calls_to("one.image.update")[0].args[2],
            Value::Int(0)
        );
    }

    #[tokio::test]
    async fn test_update_with_no_change_issues_no_mutations() {
        let session = ScriptedSession::new();
        session.ok("one.image.info", document(7, 1));

        ImageDriver::new(context(&session))
            .update(7, &config(), &config(), &mut Default::default(), &NoopRecorder)
            .await
            .expect("update failed");

        assert_eq!(session.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_waits_until_not_found() {
        let session = ScriptedSession::new();
        session
            .ok("one.image.info", document(7, 1))
            .ok("one.image.info", document(7, 1))
            .fault("one.image.info", "[one.image.info] Error getting image [7].");

        let deleted = ImageDriver::new(context(&session))
            .delete(7, &config())
            .await
            .expect("delete failed");

        assert!(deleted);
        assert_eq!(
            session.calls_to("one.image.delete")[0].args,
            vec![Value::Int(7), Value::Bool(false)]
        );
    }

    #[tokio::test]
    async fn test_delete_wait_fails_when_rights_are_lost() {
        let session = ScriptedSession::new();
        session
            .ok("one.image.info", document(7, 1))
            .denied("one.image.info", "[one.image.info] User [3] : Not authorized");

        let result = ImageDriver::new(context(&session))
            .delete(7, &config())
            .await;

        assert!(matches!(result, Err(NebulaError::Remote(_))));
        assert_eq!(session.calls_to("one.image.delete").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_of_vanished_image_is_a_no_op() {
        let session = ScriptedSession::new();
        session.fault("one.image.info", "missing");
        session.ok("one.imagepool.info", "<IMAGE_POOL/>");

        let deleted = ImageDriver::new(context(&session))
            .delete(7, &config())
            .await
            .expect("delete failed");

        assert!(!deleted);
        assert_eq!(session.mutation_count(), 0);
    }

    #[test]
    fn test_replacement_fields() {
        let session = ScriptedSession::new();
        let driver = ImageDriver::new(context(&session));
        let old = config();

        assert!(!driver.requires_replacement(&old, &ImageConfig { name: String::from("x"), ..config() }));
        assert!(driver.requires_replacement(&old, &ImageConfig { datastore_id: 2, ..config() }));
        assert!(driver.requires_replacement(&old, &ImageConfig { persistent: false, ..config() }));
    }
}

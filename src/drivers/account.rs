//! Read-only user and group lookups.

use serde::{Deserialize, Serialize};

use crate::error::{NebulaError, RemoteError, Result};
use crate::one::PoolScope;
use crate::template::Element;

use super::{DriverContext, ResourceKind, ResourceSummary};

/// Projection of a user or group document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountObserved {
    /// Numeric ID.
    pub id: i64,
    /// Account name.
    pub name: String,
    /// Primary group (users only).
    pub group: Option<String>,
    /// Member user IDs (groups only).
    pub members: Vec<i64>,
}

impl AccountObserved {
    /// Projects a `USER` or `GROUP` document.
    ///
    /// # Errors
    ///
    /// Returns an error if `ID` is missing or malformed.
    pub fn from_element(document: &Element) -> Result<Self> {
        let members = document
            .child("USERS")
            .map(|users| {
                users
                    .children_named("ID")
                    .map(|id| {
                        id.text.trim().parse::<i64>().map_err(|_| {
                            NebulaError::from(RemoteError::invalid(format!(
                                "group member ID '{}' is not an integer",
                                id.text
                            )))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            id: document.require_i64("ID")?,
            name: document.text_or_empty("NAME"),
            group: document.child_text("GNAME").map(String::from),
            members,
        })
    }

    /// Builds a summary for reporting.
    #[must_use]
    pub fn summary(&self, kind: ResourceKind) -> ResourceSummary {
        ResourceSummary {
            kind,
            id: self.id,
            name: self.name.clone(),
            uname: String::new(),
            gname: self.group.clone().unwrap_or_default(),
            permissions: None,
            status: match kind {
                ResourceKind::Group => format!("{} members", self.members.len()),
                _ => String::from("active"),
            },
            needs_replacement: false,
            attributes: serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Looks up users and groups.
#[derive(Debug, Clone, Copy)]
pub struct AccountDriver<'a> {
    ctx: DriverContext<'a>,
}

impl<'a> AccountDriver<'a> {
    /// Creates the driver.
    #[must_use]
    pub const fn new(ctx: DriverContext<'a>) -> Self {
        Self { ctx }
    }

    /// Reads a user or group by ID or name. `None` means absent.
    ///
    /// # Errors
    ///
    /// Returns an internal error for other kinds, transport errors and
    /// malformed documents.
    pub async fn read(&self, kind: ResourceKind, reference: &str) -> Result<Option<AccountObserved>> {
        if !matches!(kind, ResourceKind::User | ResourceKind::Group) {
            return Err(NebulaError::internal(format!("{kind} is not an account kind")));
        }

        let reference = reference.trim();
        let (id, name) = match reference.parse::<i64>() {
            Ok(id) => (Some(id), ""),
            Err(_) => (None, reference),
        };

        self.ctx
            .lookup(kind, id, name, PoolScope::All)
            .await?
            .map(|document| AccountObserved::from_element(&document))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::tests::context;
    use crate::one::testing::ScriptedSession;
    use crate::one::Value;

    #[tokio::test]
    async fn test_user_by_name() {
        let session = ScriptedSession::new();
        session.ok(
            "one.userpool.info",
            "<USER_POOL><USER><ID>0</ID><NAME>oneadmin</NAME></USER>\
             <USER><ID>5</ID><NAME>alice</NAME></USER></USER_POOL>",
        );
        session.ok(
            "one.user.info",
            "<USER><ID>5</ID><GID>100</GID><GNAME>devs</GNAME><NAME>alice</NAME></USER>",
        );

        let user = AccountDriver::new(context(&session))
            .read(ResourceKind::User, "alice")
            .await
            .expect("read failed")
            .expect("found");

        assert_eq!(user.id, 5);
        assert_eq!(user.group.as_deref(), Some("devs"));
        assert_eq!(session.calls_to("one.userpool.info")[0].args, vec![Value::Bool(false)]);
        assert_eq!(
            session.calls_to("one.user.info")[0].args,
            vec![Value::Int(5), Value::Bool(false)]
        );
    }

    #[tokio::test]
    async fn test_group_by_id_lists_members() {
        let session = ScriptedSession::new();
        session.ok(
            "one.group.info",
            "<GROUP><ID>100</ID><NAME>devs</NAME><USERS><ID>5</ID><ID>6</ID></USERS></GROUP>",
        );

        let group = AccountDriver::new(context(&session))
            .read(ResourceKind::Group, "100")
            .await
            .expect("read failed")
            .expect("found");

        assert_eq!(group.members, vec![5, 6]);
        assert_eq!(group.summary(ResourceKind::Group).status, "2 members");
    }

    #[tokio::test]
    async fn test_unknown_account_is_absent() {
        let session = ScriptedSession::new();
        session.fault("one.group.info", "not found");

        let group = AccountDriver::new(context(&session))
            .read(ResourceKind::Group, "100")
            .await
            .expect("read failed");

        assert!(group.is_none());
    }

    #[tokio::test]
    async fn test_rejects_managed_kinds() {
        let session = ScriptedSession::new();
        let result = AccountDriver::new(context(&session))
            .read(ResourceKind::Image, "1")
            .await;
        assert!(result.is_err());
    }
}

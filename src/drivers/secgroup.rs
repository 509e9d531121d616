//! Security group driver.
//!
//! Security groups settle synchronously, so nothing here polls. Rule changes
//! replace the whole template and are then committed to the VMs using the
//! group.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{RuleDirection, RuleProtocol, SecurityGroupConfig, SecurityRule};
use crate::error::{ReconcileError, RemoteError, Result};
use crate::one::{ObjectHeader, PoolScope, RemoteCall, Value};
use crate::planner::{UpdatePlan, UpdateStep};
use crate::template::{Element, MarkupBuilder, UpdateMode};

use super::{
    plan_access_changes, rename_call, update_call, AllocationRecorder, DriverContext,
    ResourceDriver, ResourceKind, ResourceSummary,
};

/// Projection of a security group document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupObserved {
    /// Identity, ownership and permissions.
    pub header: ObjectHeader,
    /// Description.
    pub description: String,
    /// Rules, sorted.
    pub rules: Vec<SecurityRule>,
}

/// Drives security groups.
#[derive(Debug, Clone, Copy)]
pub struct SecurityGroupDriver<'a> {
    ctx: DriverContext<'a>,
}

impl<'a> SecurityGroupDriver<'a> {
    /// Creates the driver.
    #[must_use]
    pub const fn new(ctx: DriverContext<'a>) -> Self {
        Self { ctx }
    }
}

fn sorted_rules(rules: &[SecurityRule]) -> Vec<SecurityRule> {
    let mut rules = rules.to_vec();
    rules.sort();
    rules
}

fn rule_markup(builder: &mut MarkupBuilder, rule: &SecurityRule) {
    builder
        .open("RULE")
        .leaf("PROTOCOL", rule.protocol.as_str())
        .leaf_non_empty("RANGE", rule.range.as_deref())
        .leaf("RULE_TYPE", rule.rule_type.as_str())
        .leaf_non_empty("IP", rule.ip.as_deref())
        .leaf_non_empty("SIZE", rule.size.as_deref())
        .leaf_non_empty("NETWORK_ID", rule.network_id.as_deref())
        .leaf_non_empty("ICMP_TYPE", rule.icmp_type.as_deref())
        .close("RULE");
}

fn project_rule(element: &Element) -> Result<SecurityRule> {
    let keyword = |key: &str| element.text_or_empty(key);
    let optional = |key: &str| element.child_text(key).filter(|v| !v.is_empty()).map(String::from);

    let protocol = RuleProtocol::parse(&keyword("PROTOCOL"))
        .ok_or_else(|| RemoteError::invalid(format!("unknown rule protocol '{}'", keyword("PROTOCOL"))))?;
    let rule_type = RuleDirection::parse(&keyword("RULE_TYPE"))
        .ok_or_else(|| RemoteError::invalid(format!("unknown rule type '{}'", keyword("RULE_TYPE"))))?;

    Ok(SecurityRule {
        protocol,
        rule_type,
        ip: optional("IP"),
        size: optional("SIZE"),
        range: optional("RANGE"),
        icmp_type: optional("ICMP_TYPE"),
        network_id: optional("NETWORK_ID"),
    })
}

#[async_trait]
impl ResourceDriver for SecurityGroupDriver<'_> {
    type Desired = SecurityGroupConfig;
    type Observed = SecurityGroupObserved;

    const KIND: ResourceKind = ResourceKind::SecurityGroup;

    fn context(&self) -> &DriverContext<'_> {
        &self.ctx
    }

    fn desired_name<'d>(&self, desired: &'d SecurityGroupConfig) -> &'d str {
        &desired.name
    }

    fn build_template(&self, desired: &SecurityGroupConfig) -> Result<String> {
        let mut builder = MarkupBuilder::new();
        builder
            .open("SECURITY_GROUP")
            .leaf("NAME", &desired.name)
            .leaf_non_empty("DESCRIPTION", desired.description.as_deref());
        for rule in &desired.rules {
            rule_markup(&mut builder, rule);
        }
        builder.close("SECURITY_GROUP");
        Ok(builder.finish())
    }

    fn project(&self, document: &Element) -> Result<SecurityGroupObserved> {
        let (description, rules) = match document.child("TEMPLATE") {
            Some(template) => (
                template.text_or_empty("DESCRIPTION"),
                template
                    .children_named("RULE")
                    .map(project_rule)
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => (String::new(), Vec::new()),
        };

        Ok(SecurityGroupObserved {
            header: ObjectHeader::from_element(document)?,
            description,
            rules: sorted_rules(&rules),
        })
    }

    fn summarize(&self, observed: &SecurityGroupObserved) -> ResourceSummary {
        ResourceSummary::from_header(
            Self::KIND,
            &observed.header,
            format!("{} rules", observed.rules.len()),
            observed,
        )
    }

    fn plan_update(
        &self,
        id: i64,
        old: &SecurityGroupConfig,
        new: &SecurityGroupConfig,
    ) -> Result<UpdatePlan> {
        let mut plan = UpdatePlan::new(Self::KIND, id);
        let rules_changed = sorted_rules(&old.rules) != sorted_rules(&new.rules);

        if rules_changed || old.description != new.description {
            plan.add(
                UpdateStep::Body,
                update_call(Self::KIND, id, &self.build_template(new)?, UpdateMode::Replace),
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

        if rules_changed && new.commit {
            plan.add(
                UpdateStep::CommitDependents,
                RemoteCall::new(
                    Self::KIND.method("commit"),
                    vec![Value::Int(id), Value::Bool(new.commit_outdated_only)],
                ),
            );
        }

        Ok(plan)
    }

    async fn create(
        &self,
        desired: &SecurityGroupConfig,
        recorder: &dyn AllocationRecorder,
    ) -> Result<SecurityGroupObserved> {
        let ctx = self.ctx;
        let template = self.build_template(desired)?;

        let id = ctx
            .call_for_id(&Self::KIND.method("allocate"), vec![Value::from(template)])
            .await?;
        info!("Allocated security group {id} '{}'", desired.name);
        recorder.allocated(id).await?;

        ctx.apply_ownership(Self::KIND, id, desired.uid, desired.gid).await?;
        ctx.apply_permissions(Self::KIND, id, desired.permissions.as_deref())
            .await?;

        self.read(Some(id), &desired.name).await?.ok_or_else(|| {
            ReconcileError::NotFound {
                kind: Self::KIND,
                reference: id.to_string(),
            }
            .into()
        })
    }

    async fn read(&self, id: Option<i64>, name: &str) -> Result<Option<SecurityGroupObserved>> {
        self.ctx
            .lookup(Self::KIND, id, name, PoolScope::All)
            .await?
            .map(|document| self.project(&document))
            .transpose()
    }

    async fn delete(&self, id: i64, desired: &SecurityGroupConfig) -> Result<bool> {
        let Some(observed) = self.read(Some(id), &desired.name).await? else {
            return Ok(false);
        };
        let id = observed.header.id;

        RemoteCall::new(Self::KIND.method("delete"), vec![Value::Int(id)])
            .send(self.ctx.session)
            .await?;
        info!("Deleted security group {id}");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::tests::context;
    use crate::one::testing::ScriptedSession;
    use crate::planner::NoopRecorder;

    fn ssh_rule() -> SecurityRule {
        SecurityRule {
            protocol: RuleProtocol::Tcp,
            rule_type: RuleDirection::Inbound,
            ip: None,
            size: None,
            range: Some(String::from("22")),
            icmp_type: None,
            network_id: None,
        }
    }

    fn outbound_rule() -> SecurityRule {
        SecurityRule {
            protocol: RuleProtocol::All,
            rule_type: RuleDirection::Outbound,
            ip: None,
            size: None,
            range: None,
            icmp_type: None,
            network_id: None,
        }
    }

    fn config() -> SecurityGroupConfig {
        SecurityGroupConfig {
            name: String::from("web"),
            description: Some(String::from("web tier")),
            permissions: None,
            uid: None,
            gid: None,
            rules: vec![ssh_rule(), outbound_rule()],
            commit: true,
            commit_outdated_only: false,
        }
    }

    const DOCUMENT: &str = "<SECURITY_GROUP><ID>4</ID><UID>0</UID><GID>0</GID>\
        <UNAME>oneadmin</UNAME><GNAME>oneadmin</GNAME><NAME>web</NAME>\
        <TEMPLATE><DESCRIPTION>web tier</DESCRIPTION>\
        <RULE><PROTOCOL>TCP</PROTOCOL><RANGE>22</RANGE><RULE_TYPE>inbound</RULE_TYPE></RULE>\
        <RULE><PROTOCOL>ALL</PROTOCOL><RULE_TYPE>outbound</RULE_TYPE></RULE>\
        </TEMPLATE></SECURITY_GROUP>";

    #[test]
    fn test_template_lists_rules_in_declared_order() {
        let session = ScriptedSession::new();
        let template = SecurityGroupDriver::new(context(&session))
            .build_template(&config())
            .expect("template");

        assert_eq!(
            template,
            "<SECURITY_GROUP><NAME>web</NAME><DESCRIPTION>web tier</DESCRIPTION>\
             <RULE><PROTOCOL>TCP</PROTOCOL><RANGE>22</RANGE><RULE_TYPE>INBOUND</RULE_TYPE></RULE>\
             <RULE><PROTOCOL>ALL</PROTOCOL><RULE_TYPE>OUTBOUND</RULE_TYPE></RULE>\
             </SECURITY_GROUP>"
        );
    }

    #[test]
    fn test_projection_parses_rule_keywords() {
        let session = ScriptedSession::new();
        let observed = SecurityGroupDriver::new(context(&session))
            .project(&Element::parse(DOCUMENT).expect("parse"))
            .expect("projection");

        assert_eq!(observed.header.id, 4);
        assert_eq!(observed.rules, sorted_rules(&config().rules));
    }

    #[test]
    fn test_reordered_rules_are_not_a_change() {
        let session = ScriptedSession::new();
        let old = config();
        let new = SecurityGroupConfig {
            rules: vec![outbound_rule(), ssh_rule()],
            ..config()
        };

        let plan = SecurityGroupDriver::new(context(&session))
            .plan_update(4, &old, &new)
            .expect("plan");
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_rule_change_replaces_body_then_commits() {
        let session = ScriptedSession::new();
        session.ok("one.secgroup.info", DOCUMENT);

        let new = SecurityGroupConfig {
            rules: vec![ssh_rule()],
            permissions: Some(String::from("640")),
            ..config()
        };
        SecurityGroupDriver::new(context(&session))
            .update(4, &config(), &new, &mut Default::default(), &NoopRecorder)
            .await
            .expect("update failed");

        assert_eq!(
            session.methods(),
            vec![
                "one.secgroup.update",
                "one.secgroup.chmod",
                "one.secgroup.commit",
                "one.secgroup.info",
            ]
        );
        assert_eq!(session.calls_to("one.secgroup.update")[0].args[2], Value::Int(0));
        assert_eq!(
            session.calls_to("one.secgroup.commit")[0].args,
            vec![Value::Int(4), Value::Bool(false)]
        );
    }

    #[test]
    fn test_commit_can_be_disabled() {
        let session = ScriptedSession::new();
        let new = SecurityGroupConfig {
            rules: Vec::new(),
            commit: false,
            ..config()
        };

        let plan = SecurityGroupDriver::new(context(&session))
            .plan_update(4, &config(), &new)
            .expect("plan");
        assert!(plan.calls(UpdateStep::CommitDependents).is_empty());
        assert_eq!(plan.calls(UpdateStep::Body).len(), 1);
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let session = ScriptedSession::new();
        session.ok("one.secgroup.allocate", "4");
        session.ok("one.secgroup.info", DOCUMENT);

        let driver = SecurityGroupDriver::new(context(&session));
        let observed = driver.create(&config(), &NoopRecorder).await.expect("create failed");
        assert_eq!(observed.description, "web tier");

        assert!(driver.delete(4, &config()).await.expect("delete failed"));
        assert_eq!(
            session.calls_to("one.secgroup.delete")[0].args,
            vec![Value::Int(4)]
        );
        assert_eq!(session.calls_to("one.secgroup.allocate")[0].args.len(), 1);
    }
}

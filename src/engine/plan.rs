use serde::Serialize;

use crate::model::{ProjectSpec, ProvisionedResource, ServiceKind, SpecDiff};

/// One step of a reconciliation or deletion plan. Actions execute in strict
/// dependency order; independent service provisioning runs concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Action {
    EnsureNamespace { namespace: String },
    ProvisionService { service: String, kind: String },
    DeprovisionService { service: String, kind: String },
    GenerateManifests,
    SealSecrets,
    CommitToGit,
    TriggerSync,
    /// Remove the sync controller's application and confirm it is gone.
    DeleteApplication,
    DeleteNamespace { namespace: String },
    RemoveGitArtifacts,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnsureNamespace { namespace } => write!(f, "ensure-namespace {namespace}"),
            Self::ProvisionService { service, kind } => {
                write!(f, "provision-service {service} ({kind})")
            }
            Self::DeprovisionService { service, kind } => {
                write!(f, "deprovision-service {service} ({kind})")
            }
            Self::GenerateManifests => f.write_str("generate-manifests"),
            Self::SealSecrets => f.write_str("seal-secrets"),
            Self::CommitToGit => f.write_str("commit-to-git"),
            Self::TriggerSync => f.write_str("trigger-sync"),
            Self::DeleteApplication => f.write_str("delete-application"),
            Self::DeleteNamespace { namespace } => write!(f, "delete-namespace {namespace}"),
            Self::RemoveGitArtifacts => f.write_str("remove-git-artifacts"),
        }
    }
}

/// Build the ordered plan for a reconcile run:
/// namespace → provisioning (concurrent) → manifests → sealing → commit → sync.
///
/// Services are (re-)provisioned when they are new or changed relative to the
/// last *applied* spec — after a failed run that is everything, which is how a
/// retry re-checks idempotent connector state instead of trusting history.
pub fn build_plan(
    spec: &ProjectSpec,
    diff: &SpecDiff,
    resources: &[ProvisionedResource],
) -> Vec<Action> {
    let mut plan = vec![Action::EnsureNamespace {
        namespace: spec.namespace().to_owned(),
    }];

    for service in diff.added_services.iter().chain(&diff.changed_services) {
        plan.push(Action::ProvisionService {
            service: service.effective_name().to_owned(),
            kind: service.kind.slug().to_owned(),
        });
    }

    // An added or changed SSO deployment needs its identity client converged
    // even when the identity service itself did not change.
    let sso_touched = spec
        .deployments
        .iter()
        .filter(|d| d.sso)
        .any(|d| {
            diff.added_deployments.contains(&d.name) || diff.changed_deployments.contains(&d.name)
        });
    if sso_touched {
        if let Some(identity) = spec
            .services
            .iter()
            .find(|s| matches!(s.kind, ServiceKind::Identity { .. }))
        {
            let action = Action::ProvisionService {
                service: identity.effective_name().to_owned(),
                kind: identity.kind.slug().to_owned(),
            };
            if !plan.contains(&action) {
                plan.push(action);
            }
        }
    }

    for service in &diff.removed_services {
        plan.push(Action::DeprovisionService {
            service: service.effective_name().to_owned(),
            kind: service.kind.slug().to_owned(),
        });
    }

    // A removed SSO deployment leaves its identity client behind.
    for name in &diff.removed_deployments {
        let key = format!("sso:{name}");
        if resources.iter().any(|r| r.service == key) {
            plan.push(Action::DeprovisionService {
                service: key,
                kind: "identity".into(),
            });
        }
    }

    plan.push(Action::GenerateManifests);
    plan.push(Action::SealSecrets);
    plan.push(Action::CommitToGit);
    plan.push(Action::TriggerSync);
    plan
}

/// Build the deletion plan, reversing the provisioning order: the controller
/// application first (children, existence-confirmed), then backing services
/// (SSO clients before their realm), then the namespace, then git artifacts.
pub fn build_delete_plan(namespace: &str, resources: &[ProvisionedResource]) -> Vec<Action> {
    let mut plan = vec![Action::DeleteApplication];

    let mut ordered: Vec<&ProvisionedResource> = resources.iter().collect();
    ordered.sort_by_key(|r| {
        (
            match r.kind.as_str() {
                _ if r.service.starts_with("sso:") => 0,
                "database" | "object-storage" => 1,
                _ => 2, // identity realm last among services
            },
            r.service.clone(),
        )
    });

    for resource in ordered {
        plan.push(Action::DeprovisionService {
            service: resource.service.clone(),
            kind: resource.kind.clone(),
        });
    }

    plan.push(Action::DeleteNamespace {
        namespace: namespace.to_owned(),
    });
    plan.push(Action::RemoveGitArtifacts);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionInfo, ProjectSpec};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn spec() -> ProjectSpec {
        ProjectSpec::parse(
            r#"
name: demo
services:
  - kind: database
    user: u
    schema: s
  - kind: identity
deployments:
  - name: web
    image: nginx
    tag: "1"
    ports: [8080]
    ingress: web
    sso: true
"#,
        )
        .unwrap()
    }

    fn resource(service: &str, kind: &str) -> ProvisionedResource {
        ProvisionedResource {
            project: "demo".into(),
            service: service.into(),
            kind: kind.into(),
            connection: ConnectionInfo {
                host: "h".into(),
                port: 1,
                identifier: "i".into(),
                extra: BTreeMap::new(),
            },
            sealed_credential: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn plan_orders_namespace_first_and_sync_last() {
        let spec = spec();
        let diff = SpecDiff::between(None, &spec);
        let plan = build_plan(&spec, &diff, &[]);

        assert!(matches!(plan.first(), Some(Action::EnsureNamespace { .. })));
        assert_eq!(plan.last(), Some(&Action::TriggerSync));

        let commit_pos = plan.iter().position(|a| *a == Action::CommitToGit).unwrap();
        let seal_pos = plan.iter().position(|a| *a == Action::SealSecrets).unwrap();
        let gen_pos = plan
            .iter()
            .position(|a| *a == Action::GenerateManifests)
            .unwrap();
        let last_provision = plan
            .iter()
            .rposition(|a| matches!(a, Action::ProvisionService { .. }))
            .unwrap();

        assert!(last_provision < gen_pos);
        assert!(gen_pos < seal_pos);
        assert!(seal_pos < commit_pos);
    }

    #[test]
    fn unchanged_services_are_not_replanned() {
        let spec = spec();
        let diff = SpecDiff::between(Some(&spec), &spec);
        let plan = build_plan(&spec, &diff, &[]);
        assert!(!plan.iter().any(|a| matches!(a, Action::ProvisionService { .. })));
    }

    #[test]
    fn changed_sso_deployment_replans_identity() {
        let old = spec();
        let mut new = spec();
        new.deployments[0].tag = "2".into();
        let diff = SpecDiff::between(Some(&old), &new);
        let plan = build_plan(&new, &diff, &[]);

        assert!(plan.iter().any(|a| matches!(
            a,
            Action::ProvisionService { kind, .. } if kind == "identity"
        )));
    }

    #[test]
    fn delete_plan_reverses_order_and_confirms_children_first() {
        let resources = vec![
            resource("identity", "identity"),
            resource("database", "database"),
            resource("sso:web", "identity"),
        ];
        let plan = build_delete_plan("demo", &resources);

        assert_eq!(plan.first(), Some(&Action::DeleteApplication));
        assert_eq!(plan.last(), Some(&Action::RemoveGitArtifacts));

        let positions: Vec<usize> = ["sso:web", "database", "identity"]
            .iter()
            .map(|name| {
                plan.iter()
                    .position(|a| matches!(
                        a,
                        Action::DeprovisionService { service, .. } if service == name
                    ))
                    .unwrap()
            })
            .collect();
        // clients before backing services before the realm
        assert!(positions[0] < positions[1]);
        assert!(positions[1] < positions[2]);

        let ns_pos = plan
            .iter()
            .position(|a| matches!(a, Action::DeleteNamespace { .. }))
            .unwrap();
        assert!(positions[2] < ns_pos);
    }
}

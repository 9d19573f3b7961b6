use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Project specification
// ---------------------------------------------------------------------------

/// Declarative description of a project's required services and deployments.
/// One spec maps 1:1 to a target namespace named after the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub name: String,
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub deployments: Vec<DeploymentSpec>,
}

fn default_cluster() -> String {
    "local".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Optional; defaults to the kind slug, matching single-instance specs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: ServiceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServiceKind {
    Database {
        user: String,
        schema: String,
    },
    ObjectStorage {
        bucket: String,
    },
    Identity {
        /// Realm to create, or reuse when it already belongs to this project.
        /// Defaults to the project name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        realm: Option<String>,
    },
}

impl ServiceKind {
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Database { .. } => "database",
            Self::ObjectStorage { .. } => "object-storage",
            Self::Identity { .. } => "identity",
        }
    }
}

impl ServiceSpec {
    /// Name other parts of the spec refer to this service by.
    pub fn effective_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.kind.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub name: String,
    pub image: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Ingress host. A bare label is expanded with the cluster ingress domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<String>,
    #[serde(default)]
    pub sso: bool,
    /// Names of services this deployment consumes. Empty means all services
    /// declared in the spec.
    #[serde(default)]
    pub services: Vec<String>,
    /// Environment template; values may carry generation annotations
    /// (`random:<N>`, `bcrypt:<N>`, `skip:<literal>`).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Persistent volume size (e.g. `1Gi`); provisioned with the cluster
    /// storage class when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

impl ProjectSpec {
    /// Target namespace; 1:1 with the project name.
    pub fn namespace(&self) -> &str {
        &self.name
    }

    pub fn parse(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| e.to_string())
    }

    /// SHA-256 over the canonical JSON serialization; the run idempotency key.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }

    /// Services a deployment consumes: its declared references, or every
    /// service in the spec when none are declared.
    pub fn services_for<'a>(&'a self, deployment: &'a DeploymentSpec) -> Vec<&'a ServiceSpec> {
        if deployment.services.is_empty() {
            self.services.iter().collect()
        } else {
            self.services
                .iter()
                .filter(|s| deployment.services.iter().any(|r| r == s.effective_name()))
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_name(field: &str, value: &str, problems: &mut Vec<String>) {
    if value.is_empty() || value.len() > 63 {
        problems.push(format!(
            "{field} must be between 1 and 63 characters (got {})",
            value.len()
        ));
        return;
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        || value.starts_with('-')
        || value.ends_with('-')
    {
        problems.push(format!(
            "{field} must be a lowercase DNS label (a-z, 0-9, interior hyphens): '{value}'"
        ));
    }
}

/// Validate a spec before any side effect is attempted.
/// Returns every problem found, not just the first.
pub fn validate(spec: &ProjectSpec) -> Result<(), Vec<String>> {
    let mut problems = Vec::new();

    check_name("project name", &spec.name, &mut problems);
    if spec.cluster.is_empty() {
        problems.push("cluster must not be empty".into());
    }

    let mut service_names = HashSet::new();
    for service in &spec.services {
        let name = service.effective_name().to_owned();
        check_name("service name", &name, &mut problems);
        if !service_names.insert(name.clone()) {
            problems.push(format!("duplicate service name '{name}'"));
        }
        match &service.kind {
            ServiceKind::Database { user, schema } => {
                if user.is_empty() || schema.is_empty() {
                    problems.push(format!(
                        "database service '{name}' must declare user and schema"
                    ));
                }
            }
            ServiceKind::ObjectStorage { bucket } => {
                check_name(&format!("bucket of service '{name}'"), bucket, &mut problems);
            }
            ServiceKind::Identity { .. } => {}
        }
    }

    let mut deployment_names = HashSet::new();
    for deployment in &spec.deployments {
        check_name("deployment name", &deployment.name, &mut problems);
        if !deployment_names.insert(deployment.name.clone()) {
            problems.push(format!("duplicate deployment name '{}'", deployment.name));
        }
        if deployment.image.is_empty() {
            problems.push(format!("deployment '{}' has no image", deployment.name));
        }
        if deployment.tag.is_empty() {
            problems.push(format!("deployment '{}' has no image tag", deployment.name));
        }
        for port in &deployment.ports {
            if *port == 0 {
                problems.push(format!("deployment '{}' declares port 0", deployment.name));
            }
        }
        for reference in &deployment.services {
            if !service_names.contains(reference) {
                problems.push(format!(
                    "deployment '{}' references undeclared service '{reference}'",
                    deployment.name
                ));
            }
        }
        if deployment.sso && deployment.ingress.is_none() {
            problems.push(format!(
                "deployment '{}' enables sso but has no ingress host for redirect URIs",
                deployment.name
            ));
        }
        if deployment.ingress.is_some() && deployment.ports.is_empty() {
            problems.push(format!(
                "deployment '{}' declares an ingress but no ports",
                deployment.name
            ));
        }
        if deployment.sso
            && !spec
                .services
                .iter()
                .any(|s| matches!(s.kind, ServiceKind::Identity { .. }))
        {
            problems.push(format!(
                "deployment '{}' enables sso but the spec declares no identity service",
                deployment.name
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

// ---------------------------------------------------------------------------
// Spec diff
// ---------------------------------------------------------------------------

/// Added/changed/removed services and deployments between two spec versions.
#[derive(Debug, Default)]
pub struct SpecDiff {
    pub added_services: Vec<ServiceSpec>,
    pub changed_services: Vec<ServiceSpec>,
    pub removed_services: Vec<ServiceSpec>,
    pub added_deployments: Vec<String>,
    pub changed_deployments: Vec<String>,
    pub removed_deployments: Vec<String>,
}

impl SpecDiff {
    pub fn between(old: Option<&ProjectSpec>, new: &ProjectSpec) -> Self {
        let mut diff = Self::default();

        let old_services: Vec<&ServiceSpec> = old.map(|o| o.services.iter().collect()).unwrap_or_default();
        for service in &new.services {
            match old_services
                .iter()
                .find(|o| o.effective_name() == service.effective_name())
            {
                None => diff.added_services.push(service.clone()),
                Some(o) if *o != service => diff.changed_services.push(service.clone()),
                Some(_) => {}
            }
        }
        for service in &old_services {
            if !new
                .services
                .iter()
                .any(|n| n.effective_name() == service.effective_name())
            {
                diff.removed_services.push((*service).clone());
            }
        }

        let old_deployments: Vec<&DeploymentSpec> =
            old.map(|o| o.deployments.iter().collect()).unwrap_or_default();
        for deployment in &new.deployments {
            match old_deployments.iter().find(|o| o.name == deployment.name) {
                None => diff.added_deployments.push(deployment.name.clone()),
                Some(o) if *o != deployment => diff.changed_deployments.push(deployment.name.clone()),
                Some(_) => {}
            }
        }
        for deployment in &old_deployments {
            if !new.deployments.iter().any(|n| n.name == deployment.name) {
                diff.removed_deployments.push(deployment.name.clone());
            }
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added_services.is_empty()
            && self.changed_services.is_empty()
            && self.removed_services.is_empty()
            && self.added_deployments.is_empty()
            && self.changed_deployments.is_empty()
            && self.removed_deployments.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Provisioned state
// ---------------------------------------------------------------------------

/// Non-secret connection coordinates of a provisioned backing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    /// Non-secret principal: role name, access key id, or client id.
    pub identifier: String,
    /// Kind-specific extras (database name, bucket, discovery URL, ...).
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// A backing-service credential/connection set created for a project.
/// Credential material is held only in sealed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub project: String,
    pub service: String,
    pub kind: String,
    pub connection: ConnectionInfo,
    /// `base64+sealed:` value; the only persisted form of the credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_credential: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Record of one publish to the GitOps repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitRecord {
    pub repository: String,
    pub branch: String,
    pub commit: String,
    pub files: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_spec() -> ProjectSpec {
        ProjectSpec::parse(
            r#"
name: demo
cluster: local
services:
  - kind: database
    user: demo_user
    schema: demo_schema
deployments:
  - name: web
    image: nginx
    tag: "1.21"
    ports: [8080]
"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_minimal_spec() {
        let spec = demo_spec();
        assert_eq!(spec.name, "demo");
        assert_eq!(spec.services.len(), 1);
        assert_eq!(spec.services[0].effective_name(), "database");
        assert_eq!(spec.deployments[0].ports, vec![8080]);
    }

    #[test]
    fn validate_accepts_demo_spec() {
        assert!(validate(&demo_spec()).is_ok());
    }

    #[test]
    fn validate_rejects_dangling_service_reference() {
        let mut spec = demo_spec();
        spec.deployments[0].services = vec!["cache".into()];
        let problems = validate(&spec).unwrap_err();
        assert!(problems.iter().any(|p| p.contains("undeclared service 'cache'")));
    }

    #[test]
    fn validate_rejects_bad_project_name() {
        let mut spec = demo_spec();
        spec.name = "Demo_Project".into();
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_services() {
        let mut spec = demo_spec();
        spec.services.push(spec.services[0].clone());
        let problems = validate(&spec).unwrap_err();
        assert!(problems.iter().any(|p| p.contains("duplicate service")));
    }

    #[test]
    fn validate_rejects_sso_without_ingress() {
        let mut spec = demo_spec();
        spec.deployments[0].sso = true;
        let problems = validate(&spec).unwrap_err();
        assert!(problems.iter().any(|p| p.contains("sso")));
    }

    #[test]
    fn validate_collects_all_problems() {
        let mut spec = demo_spec();
        spec.name = "BAD".into();
        spec.deployments[0].image = String::new();
        let problems = validate(&spec).unwrap_err();
        assert!(problems.len() >= 2);
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(demo_spec().content_hash(), demo_spec().content_hash());
    }

    #[test]
    fn content_hash_changes_with_spec() {
        let mut spec = demo_spec();
        spec.deployments[0].tag = "1.22".into();
        assert_ne!(spec.content_hash(), demo_spec().content_hash());
    }

    #[test]
    fn empty_service_list_references_all_services() {
        let spec = demo_spec();
        let refs = spec.services_for(&spec.deployments[0]);
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn diff_against_none_marks_everything_added() {
        let spec = demo_spec();
        let diff = SpecDiff::between(None, &spec);
        assert_eq!(diff.added_services.len(), 1);
        assert_eq!(diff.added_deployments, vec!["web".to_owned()]);
        assert!(diff.removed_services.is_empty());
    }

    #[test]
    fn diff_detects_changed_deployment() {
        let old = demo_spec();
        let mut new = demo_spec();
        new.deployments[0].tag = "1.22".into();
        let diff = SpecDiff::between(Some(&old), &new);
        assert!(diff.added_deployments.is_empty());
        assert_eq!(diff.changed_deployments, vec!["web".to_owned()]);
    }

    #[test]
    fn diff_detects_removed_service() {
        let old = demo_spec();
        let mut new = demo_spec();
        new.services.clear();
        let diff = SpecDiff::between(Some(&old), &new);
        assert_eq!(diff.removed_services.len(), 1);
    }

    #[test]
    fn diff_of_identical_specs_is_empty() {
        let spec = demo_spec();
        assert!(SpecDiff::between(Some(&spec), &spec).is_empty());
    }
}

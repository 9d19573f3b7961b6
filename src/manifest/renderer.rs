use std::collections::BTreeMap;

use minijinja::{Environment, UndefinedBehavior, context};

use crate::config::ClusterValues;
use crate::model::{DeploymentSpec, ProjectSpec, ProvisionedResource, ServiceKind};

use super::connection_env;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("template render failed: {0}")]
    Render(String),

    /// A deployment references a service that has no provisioned connection
    /// info; manifests must never point at nonexistent credentials.
    #[error("no provisioned connection info for service '{0}'")]
    MissingService(String),
}

/// Build the template environment. Templates are embedded; substitution and
/// conditionals only — minijinja is sandboxed, no code execution from
/// template content.
fn environment() -> Result<Environment<'static>, ManifestError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);

    for (name, source) in [
        ("deployment", include_str!("../../templates/deployment.yaml.jinja")),
        ("service", include_str!("../../templates/service.yaml.jinja")),
        ("ingress", include_str!("../../templates/ingress.yaml.jinja")),
        ("pvc", include_str!("../../templates/pvc.yaml.jinja")),
        ("secret", include_str!("../../templates/secret.yaml.jinja")),
        ("kustomization", include_str!("../../templates/kustomization.yaml.jinja")),
    ] {
        env.add_template(name, source)
            .map_err(|e| ManifestError::Render(e.to_string()))?;
    }
    Ok(env)
}

/// Resolve a deployment's ingress host: a bare label is expanded with the
/// cluster ingress domain, a value containing a dot is taken verbatim.
pub fn ingress_host(deployment: &DeploymentSpec, domain: &str) -> Option<String> {
    deployment.ingress.as_ref().map(|host| {
        if host.contains('.') {
            host.clone()
        } else {
            format!("{host}.{domain}")
        }
    })
}

/// Plain (non-secret) environment for one deployment: connection info of
/// every service it references. Fails when a referenced database or
/// object-storage service has no provisioned resource.
fn plain_env(
    spec: &ProjectSpec,
    deployment: &DeploymentSpec,
    resources: &[ProvisionedResource],
) -> Result<BTreeMap<String, String>, ManifestError> {
    let mut env = BTreeMap::new();

    for service in spec.services_for(deployment) {
        let name = service.effective_name();
        match resources.iter().find(|r| r.service == name) {
            Some(resource) => env.extend(connection_env(resource)),
            // Identity connection data is attached per deployment below.
            None if matches!(service.kind, ServiceKind::Identity { .. }) => {}
            None => return Err(ManifestError::MissingService(name.to_owned())),
        }
    }

    if deployment.sso {
        let key = format!("sso:{}", deployment.name);
        match resources.iter().find(|r| r.service == key) {
            Some(resource) => env.extend(connection_env(resource)),
            None => return Err(ManifestError::MissingService(key)),
        }
    }

    Ok(env)
}

/// Whether a deployment will carry secret material: credentials of services
/// it references, an SSO client secret, or generated env fields.
pub fn has_secret_material(
    spec: &ProjectSpec,
    deployment: &DeploymentSpec,
    resources: &[ProvisionedResource],
) -> bool {
    if deployment.sso || !deployment.env.is_empty() {
        return true;
    }
    spec.services_for(deployment).iter().any(|service| {
        resources
            .iter()
            .find(|r| r.service == service.effective_name())
            .is_some_and(|r| r.sealed_credential.is_some())
    })
}

/// Render the workload, network-exposure, ingress, storage and kustomization
/// artifacts for a project. Secret manifests are rendered separately by
/// [`render_secret_manifests`] once sealing has happened; the kustomization
/// already references them when material will exist. Deterministic:
/// identical input produces byte-identical output.
pub fn render_workloads(
    spec: &ProjectSpec,
    cluster: &ClusterValues,
    resources: &[ProvisionedResource],
) -> Result<BTreeMap<String, String>, ManifestError> {
    let env = environment()?;
    let render = |name: &str, ctx: minijinja::Value| -> Result<String, ManifestError> {
        env.get_template(name)
            .map_err(|e| ManifestError::Render(e.to_string()))?
            .render(ctx)
            .map_err(|e| ManifestError::Render(e.to_string()))
    };

    let mut files = BTreeMap::new();
    let project_dir = format!("projects/{}", spec.name);

    for deployment in &spec.deployments {
        let dir = format!("{project_dir}/{}", deployment.name);
        let host = ingress_host(deployment, &cluster.ingress_domain);
        let has_secrets = has_secret_material(spec, deployment, resources);
        let env_plain = plain_env(spec, deployment, resources)?;

        let has_ingress = host.is_some();

        let ctx = context! {
            project => &spec.name,
            name => &deployment.name,
            namespace => spec.namespace(),
            image => format!("{}:{}", deployment.image, deployment.tag),
            cpu => deployment.cpu.as_deref().unwrap_or("100m"),
            memory => deployment.memory.as_deref().unwrap_or("128Mi"),
            ports => &deployment.ports,
            env_plain => &env_plain,
            has_secrets => has_secrets,
            ingress_host => &host,
            storage => &deployment.storage,
            storage_class => &cluster.storage_class,
        };

        let mut resources_list = vec!["deployment.yaml".to_owned()];
        files.insert(format!("{dir}/deployment.yaml"), render("deployment", ctx.clone())?);

        if !deployment.ports.is_empty() {
            files.insert(format!("{dir}/service.yaml"), render("service", ctx.clone())?);
            resources_list.push("service.yaml".into());
        }
        if has_ingress {
            files.insert(format!("{dir}/ingress.yaml"), render("ingress", ctx.clone())?);
            resources_list.push("ingress.yaml".into());
        }
        if deployment.storage.is_some() {
            files.insert(format!("{dir}/pvc.yaml"), render("pvc", ctx.clone())?);
            resources_list.push("pvc.yaml".into());
        }
        if has_secrets {
            resources_list.push("secret.yaml".into());
        }

        files.insert(
            format!("{dir}/kustomization.yaml"),
            render("kustomization", context! { resources => resources_list })?,
        );
    }

    let deployment_dirs: Vec<String> = spec
        .deployments
        .iter()
        .map(|d| d.name.clone())
        .collect();
    files.insert(
        format!("{project_dir}/kustomization.yaml"),
        render("kustomization", context! { resources => deployment_dirs })?,
    );

    Ok(files)
}

/// Render the sealed-secret manifest for every deployment with material.
/// Only sealed values ever reach these files.
pub fn render_secret_manifests(
    spec: &ProjectSpec,
    sealed_env: &BTreeMap<String, BTreeMap<String, String>>,
) -> Result<BTreeMap<String, String>, ManifestError> {
    let env = environment()?;
    let mut files = BTreeMap::new();

    for deployment in &spec.deployments {
        let Some(sealed) = sealed_env.get(&deployment.name) else {
            continue;
        };
        if sealed.is_empty() {
            continue;
        }

        let content = env
            .get_template("secret")
            .map_err(|e| ManifestError::Render(e.to_string()))?
            .render(context! {
                project => &spec.name,
                name => &deployment.name,
                namespace => spec.namespace(),
                sealed => sealed,
            })
            .map_err(|e| ManifestError::Render(e.to_string()))?;

        files.insert(
            format!("projects/{}/{}/secret.yaml", spec.name, deployment.name),
            content,
        );
    }

    Ok(files)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

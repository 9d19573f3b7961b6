use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;

use crate::connectors::{ConnectorError, RetryPolicy, SyncState, with_retry};
use crate::context::Context;
use crate::manifest::{self, ManifestError, credential_env_key};
use crate::model::{ProjectSpec, ProvisionedResource, ServiceKind, ServiceSpec, SpecDiff};
use crate::publish::PublishError;
use crate::secrets::engine::Recipient;
use crate::secrets::{SecretError, material};

use super::ProjectState;
use super::plan::{Action, build_delete_plan, build_plan};
use super::run::{ActionStatus, ReconciliationRun, RunStatus};

const DB_PASSWORD_LEN: usize = 24;
const S3_SECRET_LEN: usize = 40;
const ABSENCE_CONFIRM_ATTEMPTS: u32 = 10;
const ABSENCE_CONFIRM_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

/// Execute a reconcile plan against a project's state. Resources provisioned
/// along the way stay recorded in `state` even when the run fails later —
/// idempotent creates make the re-attempt safe, rollback does not happen.
pub(super) async fn execute_reconcile(
    ctx: &Context,
    spec: &ProjectSpec,
    state: &mut ProjectState,
) -> ReconciliationRun {
    let hash = spec.content_hash();
    let mut run = ReconciliationRun::new(&spec.name, &hash);
    let policy = RetryPolicy::default();

    let diff = SpecDiff::between(state.last_applied.as_ref(), spec);
    run.set_plan(build_plan(spec, &diff, &state.resources));
    run.status = RunStatus::Executing;

    // Fixed plan tail: generate → seal → commit → sync.
    let n = run.actions.len();
    let (gen_idx, seal_idx, commit_idx, sync_idx) = (n - 4, n - 3, n - 2, n - 1);

    // --- ensure namespace ---------------------------------------------------
    match with_retry(policy, "ensure-namespace", || {
        ctx.connectors
            .namespaces
            .ensure_namespace(&spec.name, spec.namespace())
    })
    .await
    {
        Ok(()) => run.mark(0, ActionStatus::Succeeded, None),
        Err(e) => {
            run.mark(0, ActionStatus::Failed, Some(e.to_string()));
            run.skip_remaining();
            run.finish(RunStatus::Failed);
            return run;
        }
    }

    // --- provision / deprovision services (independent, concurrent) --------
    struct ServiceStep {
        index: usize,
        service: String,
        deprovision: bool,
    }

    let steps: Vec<ServiceStep> = run
        .actions
        .iter()
        .enumerate()
        .filter_map(|(index, planned)| match &planned.action {
            Action::ProvisionService { service, .. } => Some(ServiceStep {
                index,
                service: service.clone(),
                deprovision: false,
            }),
            Action::DeprovisionService { service, .. } => Some(ServiceStep {
                index,
                service: service.clone(),
                deprovision: true,
            }),
            _ => None,
        })
        .collect();

    let prior = state.resources.clone();
    let results = join_all(steps.iter().map(|step| {
        let prior = &prior;
        async move {
            let result = if step.deprovision {
                deprovision_service(ctx, &step.service, prior)
                    .await
                    .map(|()| Vec::new())
            } else {
                match spec
                    .services
                    .iter()
                    .find(|s| s.effective_name() == step.service)
                {
                    Some(service) => provision_service(ctx, spec, service, prior).await,
                    None => Err(StepError::Connector(ConnectorError::Permanent(format!(
                        "service '{}' vanished from the spec",
                        step.service
                    )))),
                }
            };
            (step, result)
        }
    }))
    .await;

    let mut provisioning_failed = false;
    for (step, result) in results {
        match result {
            Ok(new_resources) => {
                run.mark(step.index, ActionStatus::Succeeded, None);
                if step.deprovision {
                    remove_resource(&mut state.resources, &step.service);
                } else {
                    for resource in new_resources {
                        state.resources.retain(|r| r.service != resource.service);
                        state.resources.push(resource);
                    }
                }
            }
            Err(e) => {
                provisioning_failed = true;
                run.mark(step.index, ActionStatus::Failed, Some(e.to_string()));
            }
        }
    }

    // A provisioning failure halts the run before publish so manifests never
    // reference credentials that do not exist.
    if provisioning_failed {
        run.skip_remaining();
        run.finish(RunStatus::Failed);
        return run;
    }

    // --- generate manifests -------------------------------------------------
    let mut files =
        match manifest::render_workloads(spec, &ctx.config.cluster_values, &state.resources) {
            Ok(files) => {
                run.mark(gen_idx, ActionStatus::Succeeded, None);
                files
            }
            Err(e) => {
                run.mark(gen_idx, ActionStatus::Failed, Some(e.to_string()));
                run.skip_remaining();
                run.finish(RunStatus::Failed);
                return run;
            }
        };

    // --- seal secrets --------------------------------------------------------
    match build_sealed_envs(ctx, spec, state) {
        Ok(sealed_envs) => match manifest::render_secret_manifests(spec, &sealed_envs) {
            Ok(secret_files) => {
                files.extend(secret_files);
                run.mark(seal_idx, ActionStatus::Succeeded, None);
            }
            Err(e) => {
                run.mark(seal_idx, ActionStatus::Failed, Some(e.to_string()));
                run.skip_remaining();
                run.finish(RunStatus::Failed);
                return run;
            }
        },
        Err(e) => {
            run.mark(seal_idx, ActionStatus::Failed, Some(e.to_string()));
            run.skip_remaining();
            run.finish(RunStatus::Failed);
            return run;
        }
    }

    // Drop sealed env caches of deployments that no longer exist.
    state
        .sealed_user_env
        .retain(|name, _| spec.deployments.iter().any(|d| d.name == *name));

    // --- commit to git -------------------------------------------------------
    // Prune whatever was published before but is no longer generated
    // (removed deployments, dropped ingresses, ...).
    let publish_result = match ctx.publisher.published_files(&spec.name).await {
        Ok(published) => {
            let removals: Vec<String> = published
                .into_iter()
                .filter(|path| !files.contains_key(path))
                .collect();
            let message = format!("launchpad: reconcile {} ({})", spec.name, &hash[..8]);
            ctx.publisher
                .publish(&spec.name, &files, &removals, &message)
                .await
        }
        Err(e) => Err(e),
    };

    match publish_result {
        Ok(outcome) => {
            run.commit = outcome.commit;
            run.mark(commit_idx, ActionStatus::Succeeded, None);
        }
        Err(e) => {
            // Infrastructure already succeeded; never silently dropped.
            run.mark(commit_idx, ActionStatus::Failed, Some(e.to_string()));
            run.skip_remaining();
            run.finish(RunStatus::PartiallyCompleted);
            return run;
        }
    }

    // --- trigger sync --------------------------------------------------------
    match with_retry(policy, "trigger-sync", || {
        ctx.connectors.sync.trigger_sync(&spec.name)
    })
    .await
    {
        Ok(()) => {
            run.mark(sync_idx, ActionStatus::Succeeded, None);
            run.finish(RunStatus::Succeeded);
        }
        Err(e) => {
            run.mark(sync_idx, ActionStatus::Failed, Some(e.to_string()));
            run.finish(RunStatus::PartiallyCompleted);
        }
    }

    run
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// Execute a deletion plan: children deleted and existence-confirmed before
/// their parent, artifacts removed last. Absence at any step is success.
pub(super) async fn execute_delete(
    ctx: &Context,
    project: &str,
    state: &mut ProjectState,
) -> ReconciliationRun {
    let mut run = ReconciliationRun::new(project, "delete");
    run.set_plan(build_delete_plan(project, &state.resources));
    run.status = RunStatus::Executing;

    for index in 0..run.actions.len() {
        let action = run.actions[index].action.clone();
        let result: Result<(), StepError> = match &action {
            Action::DeleteApplication => delete_application_confirmed(ctx, project).await,
            Action::DeprovisionService { service, .. } => {
                let resources = state.resources.clone();
                match deprovision_service(ctx, service, &resources).await {
                    Ok(()) => {
                        remove_resource(&mut state.resources, service);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Action::DeleteNamespace { namespace } => delete_namespace_confirmed(ctx, namespace).await,
            Action::RemoveGitArtifacts => match ctx.publisher.remove_project(project).await {
                Ok(outcome) => {
                    run.commit = outcome.commit;
                    Ok(())
                }
                Err(e) => Err(StepError::Publish(e)),
            },
            _ => Ok(()),
        };

        match result {
            Ok(()) => run.mark(index, ActionStatus::Succeeded, None),
            Err(e) => {
                run.mark(index, ActionStatus::Failed, Some(e.to_string()));
                run.skip_remaining();
                // Backing services are gone but the artifact removal failed.
                let status = if matches!(action, Action::RemoveGitArtifacts) {
                    RunStatus::PartiallyCompleted
                } else {
                    RunStatus::Failed
                };
                run.finish(status);
                return run;
            }
        }
    }

    run.finish(RunStatus::Succeeded);
    run
}

/// Delete the controller application and poll until it is confirmed absent.
async fn delete_application_confirmed(ctx: &Context, project: &str) -> Result<(), StepError> {
    let policy = RetryPolicy::default();
    with_retry(policy, "delete-application", || {
        ctx.connectors.sync.delete_application(project)
    })
    .await?;

    for _ in 0..ABSENCE_CONFIRM_ATTEMPTS {
        match ctx.connectors.sync.sync_status(project).await {
            Ok(SyncState::Absent) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.is_retryable() => {}
            Err(e) => return Err(e.into()),
        }
        tokio::time::sleep(ABSENCE_CONFIRM_DELAY).await;
    }

    Err(StepError::Connector(ConnectorError::Transient(format!(
        "application '{project}' still present after deletion"
    ))))
}

/// Request namespace deletion and give termination a bounded head start.
/// The namespace is the parent here — its children were confirmed gone
/// before this runs, so a slow termination is not an error.
async fn delete_namespace_confirmed(ctx: &Context, namespace: &str) -> Result<(), StepError> {
    let policy = RetryPolicy::default();
    with_retry(policy, "delete-namespace", || {
        ctx.connectors.namespaces.delete_namespace(namespace)
    })
    .await?;

    for _ in 0..ABSENCE_CONFIRM_ATTEMPTS {
        match ctx.connectors.namespaces.namespace_exists(namespace).await {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) if e.is_retryable() => {}
            Err(e) => return Err(e.into()),
        }
        tokio::time::sleep(ABSENCE_CONFIRM_DELAY).await;
    }

    tracing::warn!(%namespace, "namespace still terminating after deletion request");
    Ok(())
}

// ---------------------------------------------------------------------------
// Service provisioning
// ---------------------------------------------------------------------------

async fn provision_service(
    ctx: &Context,
    spec: &ProjectSpec,
    service: &ServiceSpec,
    prior: &[ProvisionedResource],
) -> Result<Vec<ProvisionedResource>, StepError> {
    let recipient = ctx.secrets.recipient_for(&spec.cluster)?;
    let name = service.effective_name();
    let existing = prior.iter().find(|r| r.service == name);
    let policy = RetryPolicy::default();

    match &service.kind {
        ServiceKind::Database { user, schema } => {
            // Reuse the stored sealed credential; generate (and thereby
            // rotate) only when none is known.
            let fresh = if has_credential(existing) {
                None
            } else {
                Some(material::random_string(DB_PASSWORD_LEN))
            };
            let provisioned = with_retry(policy, "provision-database", || {
                ctx.connectors
                    .databases
                    .ensure_database(&spec.name, user, schema, fresh.as_deref())
            })
            .await?;
            Ok(vec![to_resource(
                spec, name, "database", provisioned, existing, recipient,
            )?])
        }
        ServiceKind::ObjectStorage { bucket } => {
            let fresh = if has_credential(existing) {
                None
            } else {
                Some(material::random_string(S3_SECRET_LEN))
            };
            let provisioned = with_retry(policy, "provision-object-storage", || {
                ctx.connectors
                    .object_storage
                    .ensure_bucket(&spec.name, bucket, fresh.as_deref())
            })
            .await?;
            Ok(vec![to_resource(
                spec,
                name,
                "object-storage",
                provisioned,
                existing,
                recipient,
            )?])
        }
        ServiceKind::Identity { realm } => {
            provision_identity(ctx, spec, name, realm.as_deref(), prior, recipient).await
        }
    }
}

/// Realm for the project plus one confidential client per SSO deployment.
async fn provision_identity(
    ctx: &Context,
    spec: &ProjectSpec,
    service_name: &str,
    realm: Option<&str>,
    prior: &[ProvisionedResource],
    recipient: &Recipient,
) -> Result<Vec<ProvisionedResource>, StepError> {
    let realm = realm.map_or_else(|| spec.name.clone(), std::borrow::ToOwned::to_owned);
    let policy = RetryPolicy::default();

    with_retry(policy, "provision-realm", || {
        ctx.connectors.identity.ensure_realm(&spec.name, &realm)
    })
    .await?;

    let mut resources = Vec::new();

    // Realm-level resource; carries the discovery URL, no credential.
    let keycloak = url::Url::parse(&ctx.config.keycloak_url).ok();
    let existing_realm = prior.iter().find(|r| r.service == service_name);
    resources.push(ProvisionedResource {
        project: spec.name.clone(),
        service: service_name.to_owned(),
        kind: "identity".into(),
        connection: crate::model::ConnectionInfo {
            host: keycloak
                .as_ref()
                .and_then(url::Url::host_str)
                .unwrap_or(&ctx.config.keycloak_url)
                .to_owned(),
            port: keycloak
                .and_then(|u| u.port_or_known_default())
                .unwrap_or(8080),
            identifier: realm.clone(),
            extra: BTreeMap::from([
                ("realm".to_owned(), realm.clone()),
                (
                    "discovery_url".to_owned(),
                    format!(
                        "{}/realms/{realm}/.well-known/openid-configuration",
                        ctx.config.keycloak_url.trim_end_matches('/')
                    ),
                ),
            ]),
        },
        sealed_credential: None,
        created_at: existing_realm.map_or_else(Utc::now, |r| r.created_at),
    });

    for deployment in spec.deployments.iter().filter(|d| d.sso) {
        let client_id = format!("{}-{}", spec.name, deployment.name);
        let host = manifest::ingress_host(deployment, &ctx.config.cluster_values.ingress_domain)
            .unwrap_or_else(|| {
                format!("{}.{}", deployment.name, ctx.config.cluster_values.ingress_domain)
            });
        let redirect_uris = vec![format!("https://{host}/*")];

        let provisioned = with_retry(policy, "provision-client", || {
            ctx.connectors
                .identity
                .ensure_client(&realm, &client_id, &redirect_uris)
        })
        .await?;

        let key = format!("sso:{}", deployment.name);
        let existing_client = prior.iter().find(|r| r.service == key);
        // The provider returns the secret on every call; keep the sealed form
        // we already have so committed files stay byte-stable.
        let sealed_credential = match existing_client.and_then(|r| r.sealed_credential.clone()) {
            Some(sealed) => Some(sealed),
            None => provisioned
                .credential
                .as_deref()
                .map(|secret| recipient.seal_value(secret))
                .transpose()?,
        };

        resources.push(ProvisionedResource {
            project: spec.name.clone(),
            service: key,
            kind: "identity".into(),
            connection: provisioned.connection,
            sealed_credential,
            created_at: existing_client.map_or_else(Utc::now, |r| r.created_at),
        });
    }

    Ok(resources)
}

fn has_credential(resource: Option<&ProvisionedResource>) -> bool {
    resource.is_some_and(|r| r.sealed_credential.is_some())
}

fn to_resource(
    spec: &ProjectSpec,
    service: &str,
    kind: &str,
    provisioned: crate::connectors::Provisioned,
    existing: Option<&ProvisionedResource>,
    recipient: &Recipient,
) -> Result<ProvisionedResource, StepError> {
    let sealed_credential = match provisioned.credential.as_deref() {
        Some(credential) => Some(recipient.seal_value(credential)?),
        None => existing.and_then(|r| r.sealed_credential.clone()),
    };

    Ok(ProvisionedResource {
        project: spec.name.clone(),
        service: service.to_owned(),
        kind: kind.to_owned(),
        connection: provisioned.connection,
        sealed_credential,
        created_at: existing.map_or_else(Utc::now, |r| r.created_at),
    })
}

// ---------------------------------------------------------------------------
// Service deprovisioning
// ---------------------------------------------------------------------------

/// Tear down one provisioned resource. A resource we have no record of is
/// already gone — absence is success.
async fn deprovision_service(
    ctx: &Context,
    service: &str,
    resources: &[ProvisionedResource],
) -> Result<(), StepError> {
    let Some(resource) = resources.iter().find(|r| r.service == service) else {
        return Ok(());
    };
    let policy = RetryPolicy::default();
    let conn = &resource.connection;

    match resource.kind.as_str() {
        "database" => {
            let schema = conn.extra.get("schema").cloned().unwrap_or_default();
            with_retry(policy, "drop-database", || {
                ctx.connectors
                    .databases
                    .drop_database(&conn.identifier, &schema)
            })
            .await?;
        }
        "object-storage" => {
            let bucket = conn.extra.get("bucket").cloned().unwrap_or_default();
            with_retry(policy, "delete-bucket", || {
                ctx.connectors
                    .object_storage
                    .delete_bucket(&resource.project, &bucket)
            })
            .await?;
        }
        _ if service.starts_with("sso:") => {
            let realm = conn.extra.get("realm").cloned().unwrap_or_default();
            with_retry(policy, "delete-client", || {
                ctx.connectors.identity.delete_client(&realm, &conn.identifier)
            })
            .await?;
        }
        _ => {
            let realm = conn
                .extra
                .get("realm")
                .cloned()
                .unwrap_or_else(|| conn.identifier.clone());
            with_retry(policy, "delete-realm", || {
                ctx.connectors.identity.delete_realm(&realm)
            })
            .await?;
        }
    }

    Ok(())
}

/// Remove a resource from the registry; deleting an identity realm takes its
/// clients with it.
fn remove_resource(resources: &mut Vec<ProvisionedResource>, service: &str) {
    let is_realm = resources
        .iter()
        .any(|r| r.service == service && r.kind == "identity" && !service.starts_with("sso:"));
    resources.retain(|r| {
        r.service != service && !(is_realm && r.service.starts_with("sso:"))
    });
}

// ---------------------------------------------------------------------------
// Secret assembly
// ---------------------------------------------------------------------------

/// Assemble the sealed env document for every deployment with material:
/// credentials of referenced services, the SSO client secret, and the
/// deployment's annotated env template. Rendered templates are cached per
/// deployment and reused while the template is unchanged so committed files
/// stay byte-stable.
fn build_sealed_envs(
    ctx: &Context,
    spec: &ProjectSpec,
    state: &mut ProjectState,
) -> Result<BTreeMap<String, BTreeMap<String, String>>, StepError> {
    let recipient = ctx.secrets.recipient_for(&spec.cluster)?;
    let mut sealed_envs = BTreeMap::new();

    for deployment in &spec.deployments {
        if !manifest::has_secret_material(spec, deployment, &state.resources) {
            continue;
        }

        let mut doc = BTreeMap::new();

        for service in spec.services_for(deployment) {
            if let Some(resource) = state
                .resources
                .iter()
                .find(|r| r.service == service.effective_name())
            {
                if let Some(sealed) = &resource.sealed_credential {
                    doc.insert(credential_env_key(&resource.kind).to_owned(), sealed.clone());
                }
            }
        }

        if deployment.sso {
            let key = format!("sso:{}", deployment.name);
            if let Some(sealed) = state
                .resources
                .iter()
                .find(|r| r.service == key)
                .and_then(|r| r.sealed_credential.clone())
            {
                doc.insert("OIDC_CLIENT_SECRET".to_owned(), sealed);
            }
        }

        if !deployment.env.is_empty() {
            let cached = state
                .sealed_user_env
                .get(&deployment.name)
                .filter(|(template, _)| *template == deployment.env)
                .map(|(_, sealed)| sealed.clone());

            let rendered = match cached {
                Some(sealed) => sealed,
                None => {
                    let rendered = material::render_material(&deployment.env, recipient)?;
                    // The plaintext rendering is intentionally dropped here;
                    // it exists for one-time display, never for persistence.
                    state.sealed_user_env.insert(
                        deployment.name.clone(),
                        (deployment.env.clone(), rendered.sealed.clone()),
                    );
                    rendered.sealed
                }
            };
            doc.extend(rendered);
        }

        sealed_envs.insert(deployment.name.clone(), doc);
    }

    Ok(sealed_envs)
}

#![allow(dead_code)] // shared across several integration test binaries

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use launchpad::config::{ClusterValues, Config, PublishMode};
use launchpad::connectors::{
    ConnectorError, Connectors, DatabaseProvisioner, IdentityProvisioner, NamespaceProvisioner,
    ObjectStorageProvisioner, Provisioned, SyncController, SyncState,
};
use launchpad::context::Context;
use launchpad::engine::Orchestrator;
use launchpad::model::ConnectionInfo;
use launchpad::publish::GitPublisher;
use launchpad::secrets::{SealingKey, SecretEngine};

// ---------------------------------------------------------------------------
// Mock connector hub
// ---------------------------------------------------------------------------

/// Shared state behind every mock connector: an ordered event log plus the
/// "external" resources, so tests can count side effects exactly.
#[derive(Default)]
pub struct MockHub {
    log: Mutex<Vec<String>>,
    pub namespaces: Mutex<HashMap<String, String>>,
    pub db_roles: Mutex<HashMap<String, String>>,
    pub buckets: Mutex<HashMap<String, String>>,
    pub realms: Mutex<HashMap<String, String>>,
    pub clients: Mutex<HashSet<String>>,
    pub app_present: AtomicBool,

    // failure injection
    pub namespace_delay_ms: AtomicU64,
    pub db_transient_remaining: AtomicU32,
    pub fail_database: AtomicBool,
    pub fail_sync: AtomicBool,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: impl Into<String>) {
        self.log.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.log.lock().unwrap().iter().position(|e| e == event)
    }

    pub fn connectors(self: &Arc<Self>) -> Connectors {
        Connectors {
            namespaces: Arc::new(NsMock(Arc::clone(self))),
            databases: Arc::new(DbMock(Arc::clone(self))),
            object_storage: Arc::new(BucketMock(Arc::clone(self))),
            identity: Arc::new(IdentityMock(Arc::clone(self))),
            sync: Arc::new(SyncMock(Arc::clone(self))),
        }
    }
}

fn conn(host: &str, port: u16, identifier: &str, extra: &[(&str, &str)]) -> ConnectionInfo {
    ConnectionInfo {
        host: host.to_owned(),
        port,
        identifier: identifier.to_owned(),
        extra: extra
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect(),
    }
}

pub struct NsMock(pub Arc<MockHub>);

#[async_trait]
impl NamespaceProvisioner for NsMock {
    async fn ensure_namespace(&self, project: &str, namespace: &str) -> Result<(), ConnectorError> {
        let delay = self.0.namespace_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let owner = self.0.namespaces.lock().unwrap().get(namespace).cloned();
        match owner {
            Some(owner) if owner != project => {
                return Err(ConnectorError::Conflict {
                    resource: format!("namespace/{namespace}"),
                    owner,
                });
            }
            Some(_) => {}
            None => {
                self.0
                    .namespaces
                    .lock()
                    .unwrap()
                    .insert(namespace.to_owned(), project.to_owned());
                self.0.push(format!("create-namespace:{namespace}"));
            }
        }
        self.0.push(format!("ensure-namespace:{namespace}"));
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ConnectorError> {
        self.0.namespaces.lock().unwrap().remove(namespace);
        self.0.push(format!("delete-namespace:{namespace}"));
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ConnectorError> {
        Ok(self.0.namespaces.lock().unwrap().contains_key(namespace))
    }
}

pub struct DbMock(pub Arc<MockHub>);

#[async_trait]
impl DatabaseProvisioner for DbMock {
    async fn ensure_database(
        &self,
        project: &str,
        user: &str,
        schema: &str,
        password: Option<&str>,
    ) -> Result<Provisioned, ConnectorError> {
        self.0.push(format!("ensure-database:{user}"));

        if self.0.fail_database.load(Ordering::SeqCst) {
            return Err(ConnectorError::Permanent("database admin said no".into()));
        }
        if self
            .0
            .db_transient_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConnectorError::Transient("connection reset".into()));
        }

        let owner = self.0.db_roles.lock().unwrap().get(user).cloned();
        let created = match owner {
            Some(owner) if owner != project => {
                return Err(ConnectorError::Conflict {
                    resource: format!("role/{user}"),
                    owner,
                });
            }
            Some(_) => false,
            None => {
                self.0
                    .db_roles
                    .lock()
                    .unwrap()
                    .insert(user.to_owned(), project.to_owned());
                self.0.push(format!("create-database:{user}"));
                true
            }
        };

        Ok(Provisioned {
            connection: conn("db.internal", 5432, user, &[("database", "apps"), ("schema", schema)]),
            credential: password.map(ToOwned::to_owned),
            created,
        })
    }

    async fn drop_database(&self, user: &str, _schema: &str) -> Result<(), ConnectorError> {
        self.0.db_roles.lock().unwrap().remove(user);
        self.0.push(format!("drop-database:{user}"));
        Ok(())
    }
}

pub struct BucketMock(pub Arc<MockHub>);

#[async_trait]
impl ObjectStorageProvisioner for BucketMock {
    async fn ensure_bucket(
        &self,
        project: &str,
        bucket: &str,
        secret_key: Option<&str>,
    ) -> Result<Provisioned, ConnectorError> {
        self.0.push(format!("ensure-bucket:{bucket}"));

        let owner = self.0.buckets.lock().unwrap().get(bucket).cloned();
        let created = match owner {
            Some(owner) if owner != project => {
                return Err(ConnectorError::Conflict {
                    resource: format!("bucket/{bucket}"),
                    owner,
                });
            }
            Some(_) => false,
            None => {
                self.0
                    .buckets
                    .lock()
                    .unwrap()
                    .insert(bucket.to_owned(), project.to_owned());
                self.0.push(format!("create-bucket:{bucket}"));
                true
            }
        };

        Ok(Provisioned {
            connection: conn(
                "http://minio.internal:9000",
                9000,
                &format!("{project}-{bucket}"),
                &[("bucket", bucket), ("region", "us-east-1")],
            ),
            credential: secret_key.map(ToOwned::to_owned),
            created,
        })
    }

    async fn delete_bucket(&self, _project: &str, bucket: &str) -> Result<(), ConnectorError> {
        self.0.buckets.lock().unwrap().remove(bucket);
        self.0.push(format!("delete-bucket:{bucket}"));
        Ok(())
    }
}

pub struct IdentityMock(pub Arc<MockHub>);

#[async_trait]
impl IdentityProvisioner for IdentityMock {
    async fn ensure_realm(&self, project: &str, realm: &str) -> Result<(), ConnectorError> {
        self.0.push(format!("ensure-realm:{realm}"));
        let owner = self.0.realms.lock().unwrap().get(realm).cloned();
        match owner {
            Some(owner) if owner != project => Err(ConnectorError::Conflict {
                resource: format!("realm/{realm}"),
                owner,
            }),
            Some(_) => Ok(()),
            None => {
                self.0
                    .realms
                    .lock()
                    .unwrap()
                    .insert(realm.to_owned(), project.to_owned());
                self.0.push(format!("create-realm:{realm}"));
                Ok(())
            }
        }
    }

    async fn ensure_client(
        &self,
        realm: &str,
        client_id: &str,
        _redirect_uris: &[String],
    ) -> Result<Provisioned, ConnectorError> {
        self.0.push(format!("ensure-client:{client_id}"));
        let created = self.0.clients.lock().unwrap().insert(client_id.to_owned());
        if created {
            self.0.push(format!("create-client:{client_id}"));
        }
        let discovery = format!(
            "http://keycloak.internal/realms/{realm}/.well-known/openid-configuration"
        );
        Ok(Provisioned {
            connection: conn(
                "keycloak.internal",
                8080,
                client_id,
                &[
                    ("realm", realm),
                    ("client_id", client_id),
                    ("discovery_url", discovery.as_str()),
                ],
            ),
            credential: Some(format!("secret-{client_id}")),
            created,
        })
    }

    async fn delete_client(&self, _realm: &str, client_id: &str) -> Result<(), ConnectorError> {
        self.0.clients.lock().unwrap().remove(client_id);
        self.0.push(format!("delete-client:{client_id}"));
        Ok(())
    }

    async fn delete_realm(&self, realm: &str) -> Result<(), ConnectorError> {
        self.0.realms.lock().unwrap().remove(realm);
        self.0.push(format!("delete-realm:{realm}"));
        Ok(())
    }
}

pub struct SyncMock(pub Arc<MockHub>);

#[async_trait]
impl SyncController for SyncMock {
    async fn trigger_sync(&self, project: &str) -> Result<(), ConnectorError> {
        self.0.push(format!("trigger-sync:{project}"));
        if self.0.fail_sync.load(Ordering::SeqCst) {
            return Err(ConnectorError::Transient("controller unreachable".into()));
        }
        self.0.app_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn sync_status(&self, _project: &str) -> Result<SyncState, ConnectorError> {
        if self.0.app_present.load(Ordering::SeqCst) {
            Ok(SyncState::Synced)
        } else {
            Ok(SyncState::Absent)
        }
    }

    async fn delete_application(&self, project: &str) -> Result<(), ConnectorError> {
        self.0.push(format!("delete-application:{project}"));
        self.0.app_present.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Git fixtures
// ---------------------------------------------------------------------------

pub async fn git(dir: &Path, args: &[&str]) -> String {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args([
            "-c",
            "user.name=test",
            "-c",
            "user.email=test@localhost",
        ])
        .args(args)
        .output()
        .await
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Create a bare remote seeded with one empty commit on `main`.
pub async fn init_remote(root: &Path, name: &str) -> PathBuf {
    let bare = root.join(format!("{name}.git"));
    tokio::fs::create_dir_all(&bare).await.unwrap();
    git(&bare, &["init", "--bare", "-b", "main", "."]).await;

    let seed = root.join(format!("{name}-seed"));
    tokio::fs::create_dir_all(&seed).await.unwrap();
    git(&seed, &["init", "-b", "main", "."]).await;
    git(&seed, &["commit", "--allow-empty", "-m", "seed"]).await;
    git(&seed, &["remote", "add", "origin", &bare.to_string_lossy()]).await;
    git(&seed, &["push", "origin", "main"]).await;

    bare
}

/// Commit a file into a remote via a scratch working copy.
pub async fn commit_file(root: &Path, bare: &Path, path: &str, content: &str) {
    let work = root.join("scratch");
    if !work.join(".git").exists() {
        tokio::fs::create_dir_all(&work).await.unwrap();
        git(&work, &["init", "-b", "main", "."]).await;
        git(&work, &["remote", "add", "origin", &bare.to_string_lossy()]).await;
    }
    git(&work, &["fetch", "origin", "main"]).await;
    git(&work, &["reset", "--hard", "origin/main"]).await;

    let full = work.join(path);
    tokio::fs::create_dir_all(full.parent().unwrap()).await.unwrap();
    tokio::fs::write(&full, content).await.unwrap();
    git(&work, &["add", "--all"]).await;
    git(&work, &["commit", "-m", "update"]).await;
    git(&work, &["push", "origin", "main"]).await;
}

/// Remove a file from a remote via the scratch working copy.
pub async fn remove_file(root: &Path, bare: &Path, path: &str) {
    let work = root.join("scratch");
    git(&work, &["fetch", "origin", "main"]).await;
    git(&work, &["reset", "--hard", "origin/main"]).await;
    git(&work, &["rm", "-r", path]).await;
    git(&work, &["commit", "-m", "remove"]).await;
    git(&work, &["push", "origin", "main"]).await;
}

pub async fn rev_count(bare: &Path) -> usize {
    git(bare, &["rev-list", "--count", "main"])
        .await
        .trim()
        .parse()
        .unwrap()
}

/// Read a file's content at the remote's `main`, or None if absent.
pub async fn remote_file(bare: &Path, path: &str) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(bare)
        .args(["show", &format!("main:{path}")])
        .output()
        .await
        .unwrap();
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
}

// ---------------------------------------------------------------------------
// Context / orchestrator wiring
// ---------------------------------------------------------------------------

pub fn test_config(workdir: &Path, gitops_remote: &Path) -> Config {
    Config {
        cluster: "local".into(),
        cluster_values: ClusterValues {
            ingress_domain: "apps.example.org".into(),
            storage_class: "standard".into(),
        },
        database_admin_url: "postgres://unused".into(),
        database_host: "db.internal".into(),
        database_port: 5432,
        database_name: "apps".into(),
        minio_alias: "test".into(),
        minio_host: "http://minio.internal:9000".into(),
        minio_region: "us-east-1".into(),
        keycloak_url: "http://keycloak.internal:8080".into(),
        keycloak_admin_user: "admin".into(),
        keycloak_admin_password: "admin".into(),
        sync_url: "http://argo.internal".into(),
        sync_token: None,
        gitops_repo_url: gitops_remote.to_string_lossy().into_owned(),
        gitops_branch: "main".into(),
        publish_mode: PublishMode::Direct,
        merge_request_endpoint: None,
        spec_repo_url: String::new(),
        spec_branch: "main".into(),
        poll_interval_s: 3600,
        workdir: workdir.to_owned(),
        private_key_file: workdir.join("unused.key"),
        recipients: Vec::new(),
        max_concurrent_runs: 4,
    }
}

pub fn test_context(hub: &Arc<MockHub>, workdir: &Path, gitops_remote: &Path) -> Arc<Context> {
    let config = test_config(workdir, gitops_remote);
    let identity = SealingKey::generate();
    let mut recipients = HashMap::new();
    recipients.insert("local".to_owned(), identity.recipient());
    let secrets = SecretEngine::new(identity, recipients);
    let publisher = GitPublisher::new(
        &config.workdir,
        &config.gitops_repo_url,
        &config.gitops_branch,
        config.publish_mode,
        None,
    );
    Arc::new(Context::new(config, secrets, hub.connectors(), publisher))
}

pub fn orchestrator(ctx: Arc<Context>) -> (Orchestrator, tokio::sync::watch::Sender<bool>) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    (Orchestrator::new(ctx, rx), tx)
}

pub fn demo_spec() -> launchpad::model::ProjectSpec {
    launchpad::model::ProjectSpec::parse(DEMO_SPEC_YAML).unwrap()
}

pub const DEMO_SPEC_YAML: &str = r#"
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
"#;

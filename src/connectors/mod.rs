pub mod database;
pub mod deploy;
pub mod identity;
pub mod namespace;
pub mod object_storage;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::ConnectionInfo;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Errors surfaced by connector operations. Connectors never swallow errors;
/// only the reconciliation engine decides retry vs abort vs surface.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Network/timeout class; safe to retry with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Caller must fix its input; retrying cannot help.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The resource name exists but belongs to a different owner.
    #[error("conflict: '{resource}' is owned by '{owner}'")]
    Conflict { resource: String, owner: String },

    /// Auth/config problem; aborts the whole run.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Bounded exponential backoff applied to transient connector failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is
/// spent. Only [`ConnectorError::Transient`] is retried.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                tracing::warn!(
                    %operation,
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "transient connector error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability contracts
// ---------------------------------------------------------------------------

/// Result of an idempotent create. Invoking create for an already-existing
/// resource returns its connection info with `created = false` instead of
/// erroring (unless the name belongs to a different owner — Conflict).
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub connection: ConnectionInfo,
    /// Plaintext credential material, only present when newly issued or
    /// rotated. Transient; the caller seals it before anything persists.
    pub credential: Option<String>,
    pub created: bool,
}

#[async_trait]
pub trait NamespaceProvisioner: Send + Sync {
    async fn ensure_namespace(&self, project: &str, namespace: &str)
    -> Result<(), ConnectorError>;
    async fn delete_namespace(&self, namespace: &str) -> Result<(), ConnectorError>;
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ConnectorError>;
}

#[async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    /// Ensure role + schema + grants. `password` is applied (create or
    /// rotate) when given; `None` requires the role to already exist.
    async fn ensure_database(
        &self,
        project: &str,
        user: &str,
        schema: &str,
        password: Option<&str>,
    ) -> Result<Provisioned, ConnectorError>;

    async fn drop_database(&self, user: &str, schema: &str) -> Result<(), ConnectorError>;
}

#[async_trait]
pub trait ObjectStorageProvisioner: Send + Sync {
    /// Ensure bucket + access policy + access key. `secret_key` semantics
    /// mirror [`DatabaseProvisioner::ensure_database`]'s password.
    async fn ensure_bucket(
        &self,
        project: &str,
        bucket: &str,
        secret_key: Option<&str>,
    ) -> Result<Provisioned, ConnectorError>;

    async fn delete_bucket(&self, project: &str, bucket: &str) -> Result<(), ConnectorError>;
}

#[async_trait]
pub trait IdentityProvisioner: Send + Sync {
    async fn ensure_realm(&self, project: &str, realm: &str) -> Result<(), ConnectorError>;

    /// Ensure a confidential client; the provider issues the secret, which is
    /// read back for existing clients as well.
    async fn ensure_client(
        &self,
        realm: &str,
        client_id: &str,
        redirect_uris: &[String],
    ) -> Result<Provisioned, ConnectorError>;

    async fn delete_client(&self, realm: &str, client_id: &str) -> Result<(), ConnectorError>;
    async fn delete_realm(&self, realm: &str) -> Result<(), ConnectorError>;
}

/// Observed state of the sync controller's application for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    Progressing,
    Degraded,
    Absent,
}

#[async_trait]
pub trait SyncController: Send + Sync {
    async fn trigger_sync(&self, project: &str) -> Result<(), ConnectorError>;
    async fn sync_status(&self, project: &str) -> Result<SyncState, ConnectorError>;
    /// Remove the application; absence is success.
    async fn delete_application(&self, project: &str) -> Result<(), ConnectorError>;
}

/// The closed set of connectors handed to the engine at construction.
/// Selection happens in configuration/startup code, never via reflection.
#[derive(Clone)]
pub struct Connectors {
    pub namespaces: Arc<dyn NamespaceProvisioner>,
    pub databases: Arc<dyn DatabaseProvisioner>,
    pub object_storage: Arc<dyn ObjectStorageProvisioner>,
    pub identity: Arc<dyn IdentityProvisioner>,
    pub sync: Arc<dyn SyncController>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

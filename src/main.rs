use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use launchpad::config::Config;
use launchpad::connectors::Connectors;
use launchpad::context::Context;
use launchpad::engine::Orchestrator;
use launchpad::monitor::ChangeMonitor;
use launchpad::publish::GitPublisher;
use launchpad::secrets::{Recipient, SealingKey, SecretEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("LAUNCHPAD_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let cfg = Config::load();

    // The decryption identity is read exactly once from mounted material.
    let key_material = Zeroizing::new(
        tokio::fs::read_to_string(&cfg.private_key_file)
            .await
            .with_context(|| {
                format!("reading private key from {}", cfg.private_key_file.display())
            })?,
    );
    let identity = SealingKey::from_encoded(&key_material)?;

    let mut recipients = HashMap::new();
    for (environment, encoded) in &cfg.recipients {
        let recipient = Recipient::from_encoded(encoded)
            .with_context(|| format!("recipient key for environment '{environment}'"))?;
        recipients.insert(environment.clone(), recipient);
    }
    if !recipients.contains_key(&cfg.cluster) {
        tracing::warn!(
            cluster = %cfg.cluster,
            "no sealing recipient configured for the managed cluster"
        );
    }
    let secrets = SecretEngine::new(identity, recipients);

    // Connectors, selected once by configuration.
    let kube = kube::Client::try_default().await?;
    tracing::info!("kubernetes client created");

    let databases = launchpad::connectors::database::PostgresAdmin::connect_lazy(
        &cfg.database_admin_url,
        &cfg.database_host,
        cfg.database_port,
        &cfg.database_name,
    )?;
    let connectors = Connectors {
        namespaces: Arc::new(launchpad::connectors::namespace::KubeNamespaces::new(kube)),
        databases: Arc::new(databases),
        object_storage: Arc::new(launchpad::connectors::object_storage::MinioAdmin::new(
            &cfg.minio_alias,
            &cfg.minio_host,
            &cfg.minio_region,
        )),
        identity: Arc::new(launchpad::connectors::identity::KeycloakAdmin::new(
            &cfg.keycloak_url,
            &cfg.keycloak_admin_user,
            &cfg.keycloak_admin_password,
        )),
        sync: Arc::new(launchpad::connectors::deploy::ArgoSync::new(
            &cfg.sync_url,
            cfg.sync_token.as_deref(),
        )),
    };

    let publisher = GitPublisher::new(
        &cfg.workdir,
        &cfg.gitops_repo_url,
        &cfg.gitops_branch,
        cfg.publish_mode,
        cfg.merge_request_endpoint.as_deref(),
    );

    let ctx = Arc::new(Context::new(cfg.clone(), secrets, connectors, publisher));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let orchestrator = Orchestrator::new(Arc::clone(&ctx), shutdown_rx.clone());

    let monitor_handle = if cfg.spec_repo_url.is_empty() {
        tracing::warn!("LAUNCHPAD_SPEC_REPO_URL not set, change monitoring disabled");
        None
    } else {
        let monitor = ChangeMonitor::new(
            orchestrator.clone(),
            &cfg.spec_repo_url,
            &cfg.spec_branch,
            &cfg.workdir,
            Duration::from_secs(cfg.poll_interval_s),
        );
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move { monitor.run(shutdown).await }))
    };

    tracing::info!(cluster = %ctx.config.cluster, "launchpad started");

    shutdown_signal().await;

    // Refuse new runs; in-flight actions finish rather than being cut off
    // mid-way, to avoid half-applied external state.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = monitor_handle {
        let _ = handle.await;
    }

    tracing::info!("launchpad stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

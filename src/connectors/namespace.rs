use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use kube::api::{DeleteParams, ObjectMeta, PostParams};

use super::{ConnectorError, NamespaceProvisioner};

/// Label recording which project owns a namespace we created.
const OWNER_LABEL: &str = "launchpad.dev/project";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Namespace provisioner backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeNamespaces {
    client: kube::Client,
}

impl KubeNamespaces {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }
}

fn classify(err: kube::Error) -> ConnectorError {
    match err {
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => {
            ConnectorError::Fatal(format!("kubernetes auth: {ae}"))
        }
        kube::Error::Api(ae) if ae.code >= 500 => {
            ConnectorError::Transient(format!("kubernetes: {ae}"))
        }
        kube::Error::Api(ae) => ConnectorError::Permanent(format!("kubernetes: {ae}")),
        other => ConnectorError::Transient(format!("kubernetes: {other}")),
    }
}

#[async_trait]
impl NamespaceProvisioner for KubeNamespaces {
    #[tracing::instrument(skip(self), fields(%project, %namespace), err)]
    async fn ensure_namespace(
        &self,
        project: &str,
        namespace: &str,
    ) -> Result<(), ConnectorError> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_owned()),
                labels: Some(BTreeMap::from([
                    (OWNER_LABEL.to_owned(), project.to_owned()),
                    (MANAGED_BY_LABEL.to_owned(), "launchpad".to_owned()),
                ])),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };

        match self.api().create(&PostParams::default(), &ns).await {
            Ok(_) => {
                tracing::info!(%namespace, "namespace created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Already exists: idempotent success only when we own it.
                let existing = self.api().get(namespace).await.map_err(classify)?;
                let owner = existing
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(OWNER_LABEL))
                    .cloned();

                match owner {
                    Some(o) if o == project => Ok(()),
                    Some(o) => Err(ConnectorError::Conflict {
                        resource: format!("namespace/{namespace}"),
                        owner: o,
                    }),
                    None => Err(ConnectorError::Conflict {
                        resource: format!("namespace/{namespace}"),
                        owner: "unmanaged".into(),
                    }),
                }
            }
            Err(e) => Err(classify(e)),
        }
    }

    #[tracing::instrument(skip(self), fields(%namespace), err)]
    async fn delete_namespace(&self, namespace: &str) -> Result<(), ConnectorError> {
        match self.api().delete(namespace, &DeleteParams::default()).await {
            Ok(_) => {
                tracing::info!(%namespace, "namespace deletion requested");
                Ok(())
            }
            // Absence is success.
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ConnectorError> {
        match self.api().get(namespace).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }
}

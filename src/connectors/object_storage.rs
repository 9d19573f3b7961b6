use std::collections::BTreeMap;
use std::path::PathBuf;

use std::time::Duration;

use async_trait::async_trait;

use super::{ConnectorError, ObjectStorageProvisioner, Provisioned};
use crate::model::ConnectionInfo;

const MC_TIMEOUT: Duration = Duration::from_secs(60);

/// Object-storage provisioner driving the MinIO admin CLI (`mc`). The alias
/// must be preconfigured with admin credentials in the mc config.
pub struct MinioAdmin {
    alias: String,
    endpoint: String,
    region: String,
}

impl MinioAdmin {
    pub fn new(alias: &str, endpoint: &str, region: &str) -> Self {
        Self {
            alias: alias.to_owned(),
            endpoint: endpoint.to_owned(),
            region: region.to_owned(),
        }
    }

    fn bucket_path(&self, bucket: &str) -> String {
        format!("{}/{bucket}", self.alias)
    }

    fn connection_info(&self, bucket: &str, access_key: &str) -> ConnectionInfo {
        let port = url::Url::parse(&self.endpoint)
            .ok()
            .and_then(|u| u.port_or_known_default())
            .unwrap_or(9000);
        ConnectionInfo {
            host: self.endpoint.clone(),
            port,
            identifier: access_key.to_owned(),
            extra: BTreeMap::from([
                ("bucket".to_owned(), bucket.to_owned()),
                ("region".to_owned(), self.region.clone()),
            ]),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, McFailure> {
        let output = tokio::time::timeout(
            MC_TIMEOUT,
            tokio::process::Command::new("mc").args(args).output(),
        )
        .await
        .map_err(|_| McFailure {
            stderr: format!("mc {} timed out", args.first().unwrap_or(&"")),
            spawn_failed: false,
        })?
        .map_err(|e| McFailure {
            stderr: format!("failed to run mc: {e}"),
            spawn_failed: true,
        })?;

        if !output.status.success() {
            return Err(McFailure {
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                spawn_failed: false,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ConnectorError> {
        match self.run(&["ls", &self.bucket_path(bucket)]).await {
            Ok(_) => Ok(true),
            Err(f) if f.is_absence() => Ok(false),
            Err(f) => Err(f.classify()),
        }
    }

    /// Owning project recorded in the bucket's tag set, if any.
    async fn bucket_owner(&self, bucket: &str) -> Result<Option<String>, ConnectorError> {
        let out = match self
            .run(&["tag", "list", &self.bucket_path(bucket), "--json"])
            .await
        {
            Ok(out) => out,
            Err(f) if f.is_absence() => return Ok(None),
            Err(f) => return Err(f.classify()),
        };

        let parsed: serde_json::Value = serde_json::from_str(out.trim()).unwrap_or_default();
        Ok(parsed
            .get("tagset")
            .and_then(|t| t.get("project"))
            .and_then(|v| v.as_str())
            .map(std::borrow::ToOwned::to_owned))
    }

    async fn ensure_policy(&self, project: &str, bucket: &str) -> Result<String, ConnectorError> {
        let policy_name = format!("{project}-{bucket}");
        let policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Action": ["s3:*"],
                "Resource": [
                    format!("arn:aws:s3:::{bucket}"),
                    format!("arn:aws:s3:::{bucket}/*"),
                ],
            }],
        });

        let path = PathBuf::from(std::env::temp_dir())
            .join(format!("launchpad-policy-{policy_name}.json"));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&policy).unwrap_or_default())
            .await
            .map_err(|e| ConnectorError::Transient(format!("write policy file: {e}")))?;

        let result = self
            .run(&[
                "admin",
                "policy",
                "create",
                &self.alias,
                &policy_name,
                &path.to_string_lossy(),
            ])
            .await;
        let _ = tokio::fs::remove_file(&path).await;
        result.map_err(McFailure::classify_err)?;

        Ok(policy_name)
    }
}

/// A failed `mc` invocation, classified from its stderr the same way the git
/// helpers classify theirs.
struct McFailure {
    stderr: String,
    spawn_failed: bool,
}

impl McFailure {
    fn is_absence(&self) -> bool {
        let s = self.stderr.to_ascii_lowercase();
        s.contains("does not exist") || s.contains("not found") || s.contains("no such")
    }

    fn classify(&self) -> ConnectorError {
        if self.spawn_failed {
            return ConnectorError::Fatal(self.stderr.clone());
        }
        let s = self.stderr.to_ascii_lowercase();
        if s.contains("access denied") || s.contains("invalid credentials") {
            ConnectorError::Fatal(format!("object storage admin: {}", self.stderr.trim()))
        } else if s.contains("connection")
            || s.contains("timeout")
            || s.contains("timed out")
            || s.contains("unable to")
        {
            ConnectorError::Transient(format!("object storage: {}", self.stderr.trim()))
        } else {
            ConnectorError::Permanent(format!("object storage: {}", self.stderr.trim()))
        }
    }

    fn classify_err(self) -> ConnectorError {
        self.classify()
    }
}

#[async_trait]
impl ObjectStorageProvisioner for MinioAdmin {
    #[tracing::instrument(skip(self, secret_key), fields(%project, %bucket), err)]
    async fn ensure_bucket(
        &self,
        project: &str,
        bucket: &str,
        secret_key: Option<&str>,
    ) -> Result<Provisioned, ConnectorError> {
        let created = if self.bucket_exists(bucket).await? {
            match self.bucket_owner(bucket).await? {
                Some(owner) if owner == project => false,
                Some(owner) => {
                    return Err(ConnectorError::Conflict {
                        resource: format!("bucket/{bucket}"),
                        owner,
                    });
                }
                None => {
                    return Err(ConnectorError::Conflict {
                        resource: format!("bucket/{bucket}"),
                        owner: "unmanaged".into(),
                    });
                }
            }
        } else {
            self.run(&["mb", &self.bucket_path(bucket)])
                .await
                .map_err(McFailure::classify_err)?;
            self.run(&[
                "tag",
                "set",
                &self.bucket_path(bucket),
                &format!("project={project}"),
            ])
            .await
            .map_err(McFailure::classify_err)?;
            tracing::info!(%bucket, "bucket created");
            true
        };

        let policy_name = self.ensure_policy(project, bucket).await?;
        let access_key = format!("{project}-{bucket}");

        if let Some(secret) = secret_key {
            // Adding an existing user resets its secret; that is the rotation path.
            self.run(&["admin", "user", "add", &self.alias, &access_key, secret])
                .await
                .map_err(McFailure::classify_err)?;
        } else {
            match self
                .run(&["admin", "user", "info", &self.alias, &access_key])
                .await
            {
                Ok(_) => {}
                Err(f) if f.is_absence() => {
                    return Err(ConnectorError::Permanent(format!(
                        "access key '{access_key}' does not exist and no credential was supplied"
                    )));
                }
                Err(f) => return Err(f.classify()),
            }
        }

        match self
            .run(&[
                "admin",
                "policy",
                "attach",
                &self.alias,
                &policy_name,
                "--user",
                &access_key,
            ])
            .await
        {
            Ok(_) => {}
            // Attaching an already-attached policy is a no-op for us.
            Err(f) if f.stderr.to_ascii_lowercase().contains("already") => {}
            Err(f) => return Err(f.classify()),
        }

        Ok(Provisioned {
            connection: self.connection_info(bucket, &access_key),
            credential: secret_key.map(std::borrow::ToOwned::to_owned),
            created,
        })
    }

    #[tracing::instrument(skip(self), fields(%project, %bucket), err)]
    async fn delete_bucket(&self, project: &str, bucket: &str) -> Result<(), ConnectorError> {
        let access_key = format!("{project}-{bucket}");
        let policy_name = format!("{project}-{bucket}");
        let bucket_path = self.bucket_path(bucket);

        // Each step tolerates absence; deletion must be idempotent.
        for args in [
            vec!["rb", "--force", bucket_path.as_str()],
            vec!["admin", "user", "remove", self.alias.as_str(), access_key.as_str()],
            vec!["admin", "policy", "remove", self.alias.as_str(), policy_name.as_str()],
        ] {
            match self.run(&args).await {
                Ok(_) => {}
                Err(f) if f.is_absence() => {}
                Err(f) => return Err(f.classify()),
            }
        }

        tracing::info!(%bucket, "bucket, access key and policy removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(stderr: &str) -> McFailure {
        McFailure {
            stderr: stderr.to_owned(),
            spawn_failed: false,
        }
    }

    #[test]
    fn absence_detection() {
        assert!(failure("mc: <ERROR> Bucket `x` does not exist.").is_absence());
        assert!(!failure("mc: <ERROR> Access Denied.").is_absence());
    }

    #[test]
    fn access_denied_is_fatal() {
        assert!(failure("mc: <ERROR> Access Denied.").classify().is_fatal());
    }

    #[test]
    fn connection_errors_are_transient() {
        assert!(
            failure("mc: <ERROR> Unable to connect to minio:9000")
                .classify()
                .is_retryable()
        );
    }
}

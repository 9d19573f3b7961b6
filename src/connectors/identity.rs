use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use super::{ConnectorError, IdentityProvisioner, Provisioned};
use crate::model::ConnectionInfo;

/// Realm displayName marker recording the owning project.
fn owner_marker(project: &str) -> String {
    format!("launchpad:{project}")
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Identity provisioner against the Keycloak admin REST API.
pub struct KeycloakAdmin {
    http: reqwest::Client,
    base_url: String,
    admin_user: String,
    admin_password: String,
    token: tokio::sync::Mutex<Option<CachedToken>>,
}

impl KeycloakAdmin {
    pub fn new(base_url: &str, admin_user: &str, admin_password: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            admin_user: admin_user.to_owned(),
            admin_password: admin_password.to_owned(),
            token: tokio::sync::Mutex::new(None),
        }
    }

    pub fn discovery_url(&self, realm: &str) -> String {
        format!(
            "{}/realms/{realm}/.well-known/openid-configuration",
            self.base_url
        )
    }

    fn connection_info(&self, realm: &str, client_id: &str) -> ConnectionInfo {
        let url = url::Url::parse(&self.base_url).ok();
        ConnectionInfo {
            host: url
                .as_ref()
                .and_then(url::Url::host_str)
                .unwrap_or(&self.base_url)
                .to_owned(),
            port: url.and_then(|u| u.port_or_known_default()).unwrap_or(8080),
            identifier: client_id.to_owned(),
            extra: BTreeMap::from([
                ("realm".to_owned(), realm.to_owned()),
                ("client_id".to_owned(), client_id.to_owned()),
                ("discovery_url".to_owned(), self.discovery_url(realm)),
            ]),
        }
    }

    /// Grab an admin token, reusing the cached one while it is fresh.
    async fn admin_token(&self) -> Result<String, ConnectorError> {
        let mut cached = self.token.lock().await;
        if let Some(t) = cached.as_ref() {
            if t.expires_at > Instant::now() {
                return Ok(t.token.clone());
            }
        }

        let response = self
            .http
            .post(format!(
                "{}/realms/master/protocol/openid-connect/token",
                self.base_url
            ))
            .form(&[
                ("grant_type", "password"),
                ("client_id", "admin-cli"),
                ("username", self.admin_user.as_str()),
                ("password", self.admin_password.as_str()),
            ])
            .send()
            .await
            .map_err(classify_request)?;

        if !response.status().is_success() {
            return Err(ConnectorError::Fatal(format!(
                "identity admin token grant failed: {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response.json().await.map_err(classify_request)?;
        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::Fatal("token response missing access_token".into()))?
            .to_owned();
        let expires_in = body.get("expires_in").and_then(serde_json::Value::as_u64).unwrap_or(60);

        *cached = Some(CachedToken {
            token: token.clone(),
            // refresh a little before the provider expires it
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(10)),
        });
        Ok(token)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ConnectorError> {
        let token = self.admin_token().await?;
        self.http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(classify_request)
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ConnectorError> {
        let token = self.admin_token().await?;
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(classify_request)
    }

    async fn delete(&self, path: &str) -> Result<reqwest::Response, ConnectorError> {
        let token = self.admin_token().await?;
        self.http
            .delete(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(classify_request)
    }

    /// Internal id and current representation of a client, if present.
    async fn find_client(
        &self,
        realm: &str,
        client_id: &str,
    ) -> Result<Option<serde_json::Value>, ConnectorError> {
        let response = self
            .get(&format!("/admin/realms/{realm}/clients?clientId={client_id}"))
            .await?;
        let response = check_status(response, "list clients").await?;
        let clients: Vec<serde_json::Value> = response.json().await.map_err(classify_request)?;
        Ok(clients.into_iter().next())
    }

    async fn client_secret(&self, realm: &str, internal_id: &str) -> Result<String, ConnectorError> {
        let response = self
            .get(&format!(
                "/admin/realms/{realm}/clients/{internal_id}/client-secret"
            ))
            .await?;
        let response = check_status(response, "read client secret").await?;
        let body: serde_json::Value = response.json().await.map_err(classify_request)?;
        body.get("value")
            .and_then(|v| v.as_str())
            .map(std::borrow::ToOwned::to_owned)
            .ok_or_else(|| ConnectorError::Permanent("client has no secret".into()))
    }
}

fn classify_request(err: reqwest::Error) -> ConnectorError {
    if err.is_timeout() || err.is_connect() {
        ConnectorError::Transient(format!("identity provider: {err}"))
    } else {
        ConnectorError::Permanent(format!("identity provider: {err}"))
    }
}

/// Map a non-success response to the error taxonomy.
async fn check_status(
    response: reqwest::Response,
    operation: &str,
) -> Result<reqwest::Response, ConnectorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        401 | 403 => ConnectorError::Fatal(format!("identity admin {operation}: {status}")),
        500..=599 => ConnectorError::Transient(format!(
            "identity {operation}: {status} {}",
            detail.trim()
        )),
        _ => ConnectorError::Permanent(format!(
            "identity {operation}: {status} {}",
            detail.trim()
        )),
    })
}

#[async_trait]
impl IdentityProvisioner for KeycloakAdmin {
    #[tracing::instrument(skip(self), fields(%project, %realm), err)]
    async fn ensure_realm(&self, project: &str, realm: &str) -> Result<(), ConnectorError> {
        let response = self.get(&format!("/admin/realms/{realm}")).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            let body = json!({
                "realm": realm,
                "enabled": true,
                "displayName": owner_marker(project),
            });
            let response = self
                .send_json(reqwest::Method::POST, "/admin/realms", &body)
                .await?;
            check_status(response, "create realm").await?;
            tracing::info!(%realm, "realm created");
            return Ok(());
        }

        let response = check_status(response, "read realm").await?;
        let existing: serde_json::Value = response.json().await.map_err(classify_request)?;
        let display = existing
            .get("displayName")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if display == owner_marker(project) {
            Ok(())
        } else {
            Err(ConnectorError::Conflict {
                resource: format!("realm/{realm}"),
                owner: display
                    .strip_prefix("launchpad:")
                    .unwrap_or("unmanaged")
                    .to_owned(),
            })
        }
    }

    #[tracing::instrument(skip(self, redirect_uris), fields(%realm, %client_id), err)]
    async fn ensure_client(
        &self,
        realm: &str,
        client_id: &str,
        redirect_uris: &[String],
    ) -> Result<Provisioned, ConnectorError> {
        let (internal_id, created) = match self.find_client(realm, client_id).await? {
            Some(existing) => {
                let internal_id = existing
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ConnectorError::Permanent("client without id".into()))?
                    .to_owned();

                // Converge redirect URIs when they drifted from the spec.
                let current: Vec<String> = existing
                    .get("redirectUris")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                if current != redirect_uris {
                    let mut updated = existing.clone();
                    updated["redirectUris"] = json!(redirect_uris);
                    let response = self
                        .send_json(
                            reqwest::Method::PUT,
                            &format!("/admin/realms/{realm}/clients/{internal_id}"),
                            &updated,
                        )
                        .await?;
                    check_status(response, "update client").await?;
                }

                (internal_id, false)
            }
            None => {
                let body = json!({
                    "clientId": client_id,
                    "enabled": true,
                    "protocol": "openid-connect",
                    "publicClient": false,
                    "standardFlowEnabled": true,
                    "redirectUris": redirect_uris,
                });
                let response = self
                    .send_json(
                        reqwest::Method::POST,
                        &format!("/admin/realms/{realm}/clients"),
                        &body,
                    )
                    .await?;
                check_status(response, "create client").await?;

                let internal_id = self
                    .find_client(realm, client_id)
                    .await?
                    .and_then(|c| c.get("id").and_then(|v| v.as_str()).map(String::from))
                    .ok_or_else(|| {
                        ConnectorError::Transient("created client not yet visible".into())
                    })?;
                tracing::info!(%client_id, "client created");
                (internal_id, true)
            }
        };

        // The provider issues the secret; read it back for new and existing
        // clients alike.
        let secret = self.client_secret(realm, &internal_id).await?;

        Ok(Provisioned {
            connection: self.connection_info(realm, client_id),
            credential: Some(secret),
            created,
        })
    }

    #[tracing::instrument(skip(self), fields(%realm, %client_id), err)]
    async fn delete_client(&self, realm: &str, client_id: &str) -> Result<(), ConnectorError> {
        let Some(existing) = self.find_client(realm, client_id).await? else {
            return Ok(());
        };
        let internal_id = existing
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::Permanent("client without id".into()))?;

        let response = self
            .delete(&format!("/admin/realms/{realm}/clients/{internal_id}"))
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, "delete client").await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(%realm), err)]
    async fn delete_realm(&self, realm: &str) -> Result<(), ConnectorError> {
        let response = self.delete(&format!("/admin/realms/{realm}")).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, "delete realm").await?;
        tracing::info!(%realm, "realm deleted");
        Ok(())
    }
}

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{ConnectorError, DatabaseProvisioner, Provisioned};
use crate::model::ConnectionInfo;

/// Ownership marker stored as the role comment.
fn owner_comment(project: &str) -> String {
    format!("launchpad:project={project}")
}

fn owner_from_comment(comment: &str) -> Option<&str> {
    comment.strip_prefix("launchpad:project=")
}

/// Database provisioner issuing admin DDL (role, schema, grants) against the
/// backing Postgres. Statements are built dynamically — identifiers cannot be
/// bound as parameters — so identifiers are validated and quoted first.
pub struct PostgresAdmin {
    pool: PgPool,
    host: String,
    port: u16,
    database: String,
}

impl PostgresAdmin {
    pub fn connect_lazy(
        admin_url: &str,
        host: &str,
        port: u16,
        database: &str,
    ) -> Result<Self, ConnectorError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(admin_url)
            .map_err(|e| ConnectorError::Fatal(format!("database admin url: {e}")))?;
        Ok(Self {
            pool,
            host: host.to_owned(),
            port,
            database: database.to_owned(),
        })
    }

    fn connection_info(&self, user: &str, schema: &str) -> ConnectionInfo {
        ConnectionInfo {
            host: self.host.clone(),
            port: self.port,
            identifier: user.to_owned(),
            extra: BTreeMap::from([
                ("database".to_owned(), self.database.clone()),
                ("schema".to_owned(), schema.to_owned()),
            ]),
        }
    }

    async fn role_owner(&self, user: &str) -> Result<Option<String>, ConnectorError> {
        let row = sqlx::query(
            "SELECT shobj_description(r.oid, 'pg_authid') AS comment
             FROM pg_roles r WHERE r.rolname = $1",
        )
        .bind(user)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(|r| {
            r.try_get::<Option<String>, _>("comment")
                .ok()
                .flatten()
                .unwrap_or_default()
        }))
    }
}

/// Validate and double-quote a SQL identifier.
fn quote_ident(ident: &str) -> Result<String, ConnectorError> {
    if ident.is_empty()
        || ident.len() > 63
        || !ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        || ident.chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        return Err(ConnectorError::Permanent(format!(
            "invalid identifier '{ident}': lowercase letters, digits, underscores only"
        )));
    }
    Ok(format!("\"{ident}\""))
}

/// Escape a string literal for inline use (single quotes doubled).
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn classify(err: sqlx::Error) -> ConnectorError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // 28xxx — invalid authorization; 42501 — insufficient privilege
            Some(code) if code.starts_with("28") || code == "42501" => {
                ConnectorError::Fatal(format!("database admin auth: {db}"))
            }
            _ => ConnectorError::Permanent(format!("database: {db}")),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => ConnectorError::Transient(format!("database: {err}")),
        _ => ConnectorError::Permanent(format!("database: {err}")),
    }
}

#[async_trait]
impl DatabaseProvisioner for PostgresAdmin {
    #[tracing::instrument(skip(self, password), fields(%project, %user, %schema), err)]
    async fn ensure_database(
        &self,
        project: &str,
        user: &str,
        schema: &str,
        password: Option<&str>,
    ) -> Result<Provisioned, ConnectorError> {
        let role_q = quote_ident(user)?;
        let schema_q = quote_ident(schema)?;

        let created = match self.role_owner(user).await? {
            None => {
                let password = password.ok_or_else(|| {
                    ConnectorError::Permanent(format!(
                        "role '{user}' does not exist and no credential was supplied"
                    ))
                })?;
                sqlx::query(&format!(
                    "CREATE ROLE {role_q} LOGIN PASSWORD {}",
                    quote_literal(password)
                ))
                .execute(&self.pool)
                .await
                .map_err(classify)?;

                sqlx::query(&format!(
                    "COMMENT ON ROLE {role_q} IS {}",
                    quote_literal(&owner_comment(project))
                ))
                .execute(&self.pool)
                .await
                .map_err(classify)?;

                tracing::info!(%user, "database role created");
                true
            }
            Some(comment) => {
                match owner_from_comment(&comment) {
                    Some(owner) if owner == project => {}
                    Some(owner) => {
                        return Err(ConnectorError::Conflict {
                            resource: format!("role/{user}"),
                            owner: owner.to_owned(),
                        });
                    }
                    None => {
                        return Err(ConnectorError::Conflict {
                            resource: format!("role/{user}"),
                            owner: "unmanaged".into(),
                        });
                    }
                }
                // Existing role we own: rotate the password when one is given.
                if let Some(password) = password {
                    sqlx::query(&format!(
                        "ALTER ROLE {role_q} PASSWORD {}",
                        quote_literal(password)
                    ))
                    .execute(&self.pool)
                    .await
                    .map_err(classify)?;
                    tracing::info!(%user, "database credential rotated");
                }
                false
            }
        };

        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {schema_q} AUTHORIZATION {role_q}"
        ))
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        sqlx::query(&format!(
            "GRANT ALL ON SCHEMA {schema_q} TO {role_q}"
        ))
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(Provisioned {
            connection: self.connection_info(user, schema),
            credential: password.map(std::borrow::ToOwned::to_owned),
            created,
        })
    }

    #[tracing::instrument(skip(self), fields(%user, %schema), err)]
    async fn drop_database(&self, user: &str, schema: &str) -> Result<(), ConnectorError> {
        let role_q = quote_ident(user)?;
        let schema_q = quote_ident(schema)?;

        sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema_q} CASCADE"))
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        sqlx::query(&format!("DROP ROLE IF EXISTS {role_q}"))
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        tracing::info!(%user, %schema, "database role and schema dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_accepts_plain_names() {
        assert_eq!(quote_ident("demo_user").unwrap(), "\"demo_user\"");
    }

    #[test]
    fn quote_ident_rejects_injection() {
        assert!(quote_ident("user\"; DROP TABLE x; --").is_err());
        assert!(quote_ident("User").is_err());
        assert!(quote_ident("").is_err());
        assert!(quote_ident("1abc").is_err());
    }

    #[test]
    fn quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("pa'ss"), "'pa''ss'");
    }

    #[test]
    fn owner_comment_roundtrip() {
        assert_eq!(owner_from_comment(&owner_comment("demo")), Some("demo"));
        assert_eq!(owner_from_comment("something else"), None);
    }
}

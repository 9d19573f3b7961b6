pub mod renderer;

use std::collections::BTreeMap;

use crate::model::ProvisionedResource;

pub use renderer::{
    ManifestError, has_secret_material, ingress_host, render_secret_manifests, render_workloads,
};

/// Environment key that carries the sealed credential of a service kind.
pub fn credential_env_key(kind: &str) -> &'static str {
    match kind {
        "database" => "DATABASE_PASSWORD",
        "object-storage" => "S3_SECRET_KEY",
        _ => "OIDC_CLIENT_SECRET",
    }
}

/// Non-secret environment derived from a provisioned service's connection
/// info. This is the "merge" of spec §deployment fields with connection data:
/// hosts and identifiers go into plain env, credentials stay sealed.
pub fn connection_env(resource: &ProvisionedResource) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let conn = &resource.connection;

    match resource.kind.as_str() {
        "database" => {
            env.insert("DATABASE_HOST".into(), conn.host.clone());
            env.insert("DATABASE_PORT".into(), conn.port.to_string());
            env.insert("DATABASE_USER".into(), conn.identifier.clone());
            if let Some(db) = conn.extra.get("database") {
                env.insert("DATABASE_NAME".into(), db.clone());
            }
            if let Some(schema) = conn.extra.get("schema") {
                env.insert("DATABASE_SCHEMA".into(), schema.clone());
            }
        }
        "object-storage" => {
            env.insert("S3_ENDPOINT".into(), conn.host.clone());
            env.insert("S3_ACCESS_KEY".into(), conn.identifier.clone());
            if let Some(bucket) = conn.extra.get("bucket") {
                env.insert("S3_BUCKET".into(), bucket.clone());
            }
            if let Some(region) = conn.extra.get("region") {
                env.insert("S3_REGION".into(), region.clone());
            }
        }
        _ => {
            // Realm-level resources carry no client; only client resources do.
            if let Some(client_id) = conn.extra.get("client_id") {
                env.insert("OIDC_CLIENT_ID".into(), client_id.clone());
            }
            if let Some(realm) = conn.extra.get("realm") {
                env.insert("OIDC_REALM".into(), realm.clone());
            }
            if let Some(url) = conn.extra.get("discovery_url") {
                env.insert("OIDC_DISCOVERY_URL".into(), url.clone());
            }
        }
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionInfo;
    use chrono::Utc;

    #[test]
    fn database_connection_env() {
        let resource = ProvisionedResource {
            project: "demo".into(),
            service: "database".into(),
            kind: "database".into(),
            connection: ConnectionInfo {
                host: "db.internal".into(),
                port: 5432,
                identifier: "demo_user".into(),
                extra: BTreeMap::from([
                    ("database".to_owned(), "apps".to_owned()),
                    ("schema".to_owned(), "demo_schema".to_owned()),
                ]),
            },
            sealed_credential: None,
            created_at: Utc::now(),
        };

        let env = connection_env(&resource);
        assert_eq!(env["DATABASE_HOST"], "db.internal");
        assert_eq!(env["DATABASE_PORT"], "5432");
        assert_eq!(env["DATABASE_USER"], "demo_user");
        assert_eq!(env["DATABASE_SCHEMA"], "demo_schema");
    }

    #[test]
    fn credential_keys_per_kind() {
        assert_eq!(credential_env_key("database"), "DATABASE_PASSWORD");
        assert_eq!(credential_env_key("object-storage"), "S3_SECRET_KEY");
        assert_eq!(credential_env_key("identity"), "OIDC_CLIENT_SECRET");
    }
}

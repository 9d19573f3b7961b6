use launchpad::connectors::identity::KeycloakAdmin;
use launchpad::connectors::{ConnectorError, IdentityProvisioner};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/realms/master/protocol/openid-connect/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "admin-token",
            "expires_in": 300,
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn creates_realm_when_absent() {
    let server = MockServer::start().await;
    mock_token(&server).await;

    Mock::given(method("GET"))
        .and(path("/admin/realms/demo"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/admin/realms"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let admin = KeycloakAdmin::new(&server.uri(), "admin", "pw");
    admin.ensure_realm("demo", "demo").await.unwrap();
}

#[tokio::test]
async fn existing_realm_with_same_owner_is_idempotent() {
    let server = MockServer::start().await;
    mock_token(&server).await;

    Mock::given(method("GET"))
        .and(path("/admin/realms/demo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "realm": "demo",
            "displayName": "launchpad:demo",
        })))
        .mount(&server)
        .await;

    let admin = KeycloakAdmin::new(&server.uri(), "admin", "pw");
    admin.ensure_realm("demo", "demo").await.unwrap();
}

#[tokio::test]
async fn realm_owned_by_another_project_is_a_conflict() {
    let server = MockServer::start().await;
    mock_token(&server).await;

    Mock::given(method("GET"))
        .and(path("/admin/realms/demo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "realm": "demo",
            "displayName": "launchpad:someone-else",
        })))
        .mount(&server)
        .await;

    let admin = KeycloakAdmin::new(&server.uri(), "admin", "pw");
    let result = admin.ensure_realm("demo", "demo").await;
    assert!(matches!(
        result,
        Err(ConnectorError::Conflict { owner, .. }) if owner == "someone-else"
    ));
}

#[tokio::test]
async fn creates_client_and_reads_back_issued_secret() {
    let server = MockServer::start().await;
    mock_token(&server).await;

    // First lookup: not there yet; after creation it is.
    Mock::given(method("GET"))
        .and(path("/admin/realms/demo/clients"))
        .and(query_param("clientId", "demo-web"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/admin/realms/demo/clients"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/demo/clients"))
        .and(query_param("clientId", "demo-web"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": "internal-uuid",
            "clientId": "demo-web",
            "redirectUris": ["https://web.apps.example.org/*"],
        }])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/demo/clients/internal-uuid/client-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "secret",
            "value": "issued-by-provider",
        })))
        .mount(&server)
        .await;

    let admin = KeycloakAdmin::new(&server.uri(), "admin", "pw");
    let provisioned = admin
        .ensure_client("demo", "demo-web", &["https://web.apps.example.org/*".to_owned()])
        .await
        .unwrap();

    assert!(provisioned.created);
    assert_eq!(provisioned.credential.as_deref(), Some("issued-by-provider"));
    assert_eq!(provisioned.connection.identifier, "demo-web");
    assert!(
        provisioned.connection.extra["discovery_url"]
            .ends_with("/realms/demo/.well-known/openid-configuration")
    );
}

#[tokio::test]
async fn existing_client_returns_its_connection_info() {
    let server = MockServer::start().await;
    mock_token(&server).await;

    Mock::given(method("GET"))
        .and(path("/admin/realms/demo/clients"))
        .and(query_param("clientId", "demo-web"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": "internal-uuid",
            "clientId": "demo-web",
            "redirectUris": ["https://web.apps.example.org/*"],
        }])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/demo/clients/internal-uuid/client-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "secret",
            "value": "existing-secret",
        })))
        .mount(&server)
        .await;

    let admin = KeycloakAdmin::new(&server.uri(), "admin", "pw");
    let provisioned = admin
        .ensure_client("demo", "demo-web", &["https://web.apps.example.org/*".to_owned()])
        .await
        .unwrap();

    assert!(!provisioned.created);
    assert_eq!(provisioned.credential.as_deref(), Some("existing-secret"));
}

#[tokio::test]
async fn server_errors_classify_as_transient() {
    let server = MockServer::start().await;
    mock_token(&server).await;

    Mock::given(method("GET"))
        .and(path("/admin/realms/demo"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let admin = KeycloakAdmin::new(&server.uri(), "admin", "pw");
    let result = admin.ensure_realm("demo", "demo").await;
    assert!(matches!(result, Err(ConnectorError::Transient(_))));
}

#[tokio::test]
async fn bad_admin_credentials_are_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/realms/master/protocol/openid-connect/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let admin = KeycloakAdmin::new(&server.uri(), "admin", "wrong");
    let result = admin.ensure_realm("demo", "demo").await;
    assert!(matches!(result, Err(ConnectorError::Fatal(_))));
}

#[tokio::test]
async fn deleting_absent_client_is_success() {
    let server = MockServer::start().await;
    mock_token(&server).await;

    Mock::given(method("GET"))
        .and(path("/admin/realms/demo/clients"))
        .and(query_param("clientId", "demo-web"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let admin = KeycloakAdmin::new(&server.uri(), "admin", "pw");
    admin.delete_client("demo", "demo-web").await.unwrap();
}

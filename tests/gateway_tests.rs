//! End-to-end gateway routing tests
//!
//! Exercises the reserved routes and the decision engine through the real
//! router, without a running upstream or identity provider:
//! - health, roles, and access-probe endpoints
//! - 404 for unmapped paths, 401 for protected paths without a token
//! - SSO redirect construction
//! - callback parameter validation and logout cookie clearing

use authgate::clients::{ClientConfiguration, RealmUrls};
use authgate::config::Config;
use authgate::policy::ResourceConfig;
use authgate::server::{AppState, create_router};
use authgate::token::RoleRequirement;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use tower::ServiceExt;

fn unsigned_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","kid":"test-key"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

fn test_client() -> ClientConfiguration {
    ClientConfiguration {
        sid: "main".to_string(),
        client_id: "portal".to_string(),
        secret: "s3cret".to_string(),
        realm_url: RealmUrls {
            public: "https://idp.example.com/realms/main".to_string(),
            private: "http://idp.internal/realms/main".to_string(),
        },
    }
}

fn resource(pattern: &str) -> ResourceConfig {
    ResourceConfig {
        match_pattern: pattern.to_string(),
        methods: None,
        override_path: None,
        public: false,
        roles: None,
        sso_flow: false,
        client_sid: None,
    }
}

fn test_router(resources: Vec<ResourceConfig>) -> Router {
    let mut config = Config {
        public_url: "https://gateway.example.com".to_string(),
        ..Config::default()
    };
    config.upstream.url = "http://127.0.0.1:1".to_string();
    config.provider.clients = vec![test_client()];
    config.resources = resources;

    create_router(AppState::from_config(&config).unwrap())
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Health endpoint reports readiness and the current time
#[tokio::test]
async fn test_health_endpoint() {
    let router = test_router(vec![]);

    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ready"], json!(true));
    assert!(body["time"].as_u64().unwrap() > 1_600_000_000_000);
}

/// Requests matching no resource policy are 404, not forwarded
#[tokio::test]
async fn test_unmapped_path_is_404() {
    let router = test_router(vec![resource("/api/.*")]);

    let response = router
        .oneshot(Request::get("/elsewhere").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Protected resources without a token and without sso_flow answer 401
#[tokio::test]
async fn test_protected_path_without_token_is_401() {
    let router = test_router(vec![resource("/api/.*")]);

    let response = router
        .oneshot(Request::get("/api/users").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// sso_flow resources redirect unauthenticated browsers to the provider login
#[tokio::test]
async fn test_sso_redirect_for_unauthenticated_browser() {
    let mut app = resource("/app/.*");
    app.sso_flow = true;
    app.client_sid = Some("main".to_string());
    let router = test_router(vec![app]);

    let response = router
        .oneshot(Request::get("/app/home").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.starts_with("https://idp.example.com/realms/main/protocol/openid-connect/auth?"));
    assert!(location.contains("client_id=portal"));
    // redirect_uri carries the gateway callback with the original path; its
    // own query string is double-encoded inside the authorization URL
    assert!(location.contains("oauth%2Fcallback"));
    assert!(location.contains("src%3D%252Fapp%252Fhome"));
    assert!(location.contains("sid%3Dmain"));
}

/// Roles endpoint requires a token and returns the effective role list
#[tokio::test]
async fn test_roles_endpoint() {
    let router = test_router(vec![]);

    let response = router
        .clone()
        .oneshot(Request::get("/roles").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = unsigned_token(&json!({
        "exp": 4_102_444_800_u64,
        "realm_access": { "roles": ["viewer"] },
        "resource_access": { "portal": { "roles": ["admin"] } }
    }));
    let response = router
        .oneshot(
            Request::get("/roles")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let mut roles: Vec<String> =
        serde_json::from_value(body_json(response).await).unwrap();
    roles.sort();
    assert_eq!(roles, vec!["portal:admin", "viewer"]);
}

/// Access probe maps each METHOD:PATH pair to a pure policy decision
#[tokio::test]
async fn test_access_probe() {
    let mut api = resource("/api");
    api.public = true;
    let mut private = resource("/private");
    private.roles = Some(RoleRequirement {
        all: Some(vec!["admin".to_string()]),
        any: None,
    });
    let router = test_router(vec![api, private]);

    let response = router
        .oneshot(
            Request::get("/access?resource=GET:/api,GET:/private")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["GET:/api"], json!(true));
    assert_eq!(body["GET:/private"], json!(false));
}

/// Access probe honors roles carried by a presented token
#[tokio::test]
async fn test_access_probe_with_token() {
    let mut private = resource("/private");
    private.roles = Some(RoleRequirement {
        all: Some(vec!["admin".to_string()]),
        any: None,
    });
    let router = test_router(vec![private]);

    let token = unsigned_token(&json!({
        "exp": 4_102_444_800_u64,
        "realm_access": { "roles": ["admin"] }
    }));
    let response = router
        .oneshot(
            Request::get("/access?resource=GET:/private")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let body = body_json(response).await;
    assert_eq!(body["GET:/private"], json!(true));
}

/// Malformed probe entries and a missing resource parameter are 400
#[tokio::test]
async fn test_access_probe_rejects_malformed_input() {
    let router = test_router(vec![]);

    let response = router
        .clone()
        .oneshot(Request::get("/access").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(
            Request::get("/access?resource=GET/api")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Callback rejects requests missing the authorization code or client sid
#[tokio::test]
async fn test_callback_requires_code_and_sid() {
    let router = test_router(vec![]);

    let response = router
        .clone()
        .oneshot(
            Request::get("/oauth/callback?sid=main")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(
            Request::get("/oauth/callback?code=abc&sid=ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Logout clears both session cookies and redirects to the public URL
#[tokio::test]
async fn test_logout_clears_cookies_and_redirects() {
    let router = test_router(vec![]);

    let response = router
        .oneshot(Request::get("/logout?redirectTo=/bye").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "https://gateway.example.com/bye"
    );

    let cookies: Vec<&str> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap())
        .collect();
    assert_eq!(cookies.len(), 2);
    assert!(cookies.iter().any(|c| c.starts_with("access_token=")));
    assert!(cookies.iter().any(|c| c.starts_with("refresh_token=")));
    for cookie in cookies {
        // cleared at the epoch
        assert!(cookie.contains("1970"), "cookie not expired: {cookie}");
    }
}

/// Load-time validation rejects an sso_flow resource without a client
#[test]
fn test_invalid_resource_config_fails_at_startup() {
    let mut config = Config {
        public_url: "https://gateway.example.com".to_string(),
        ..Config::default()
    };
    config.upstream.url = "http://127.0.0.1:1".to_string();
    config.provider.clients = vec![test_client()];
    let mut bad = resource("/app/.*");
    bad.sso_flow = true;
    config.resources = vec![bad];

    assert!(AppState::from_config(&config).is_err());
}

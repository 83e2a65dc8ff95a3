//! Authentication portal.
//!
//! | Path            | Handler                                 |
//! |-----------------|-----------------------------------------|
//! | `/`             | `index.html`                            |
//! | `/styles.css`   | `styles.css`                            |
//! | `/script_v2.js` | `script_v2.js`                          |
//! | `/auth`         | credential check, whitelists on success |
//! | `/sse`          | keep-alive stream                       |

use std::net::IpAddr;

use axum::{
    extract::Request,
    http::Method,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::{keepalive, static_files, ApiError, ConnectionMeta, WebState};
use crate::firewall::{validate_input, InputKind};

/// Largest accepted `/auth` body.
const MAX_AUTH_BODY: usize = 16 * 1024;

#[derive(Debug, Deserialize)]
struct AuthRequest {
    username: String,
    key: String,
}

pub(crate) async fn handle(state: &WebState, req: Request, client_ip: IpAddr) -> Response {
    let Some(portal) = state.portal.as_ref() else {
        warn!("Portal route matched but the portal is disabled");
        return ApiError::unknown_domain().into_response();
    };

    let path = req.uri().path().to_string();
    let asset = match path.as_str() {
        "/" => "index.html",
        "/styles.css" | "/styles.css/" => "styles.css",
        "/script_v2.js" => "script_v2.js",
        "/auth" => return authenticate(state, req, client_ip).await,
        "/sse" => {
            let secure = req
                .extensions()
                .get::<ConnectionMeta>()
                .is_some_and(|meta| meta.tls);
            return keepalive::open(state, req.method(), client_ip, secure);
        }
        _ => return ApiError::bad_request("Bad Request").into_response(),
    };
    static_files::serve_file(&portal.static_dir.join(asset), req).await
}

async fn authenticate(state: &WebState, req: Request, client_ip: IpAddr) -> Response {
    if req.method() != Method::POST {
        return ApiError::method_not_allowed().into_response();
    }
    info!(client_ip = %client_ip, "Authentication attempt");

    let body = match axum::body::to_bytes(req.into_body(), MAX_AUTH_BODY).await {
        Ok(body) => body,
        Err(e) => {
            info!(client_ip = %client_ip, error = %e, "Unreadable authentication body");
            return ApiError::bad_request("Invalid request format").into_response();
        }
    };
    let auth: AuthRequest = match serde_json::from_slice(&body) {
        Ok(auth) => auth,
        Err(e) => {
            info!(client_ip = %client_ip, error = %e, "Malformed authentication request");
            return ApiError::bad_request("Invalid request format").into_response();
        }
    };

    if !validate_input(&auth.username, InputKind::Username)
        || !validate_input(&auth.key, InputKind::Key)
    {
        info!(client_ip = %client_ip, "Invalid characters in credentials");
        return ApiError::bad_request("Invalid characters in input").into_response();
    }

    if !state.authenticator.authenticate(&auth.username, &auth.key) {
        info!(client_ip = %client_ip, user = %auth.username, "Authentication failed");
        return ApiError::unauthorized().into_response();
    }

    state.registry.grant(client_ip);
    info!(client_ip = %client_ip, user = %auth.username, "Authenticated, client whitelisted");

    Json(json!({
        "status": "success",
        "message": "Successfully authenticated. You can now establish an SSE connection.",
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    use crate::auth::Authenticator;
    use crate::firewall::{AccessRegistry, FirewallPolicy};
    use crate::proxy::{RouteTable, TlsPolicy};
    use crate::web::{PortalConfig, Upstream};

    struct OneUser;

    impl Authenticator for OneUser {
        fn authenticate(&self, username: &str, key: &str) -> bool {
            username == "alice" && key == "validpass123!"
        }
    }

    fn state(static_dir: &std::path::Path) -> WebState {
        WebState {
            routes: Arc::new(RouteTable::build(&[], &TlsPolicy::default()).unwrap()),
            registry: Arc::new(AccessRegistry::new()),
            firewall: FirewallPolicy::default(),
            portal: Some(Arc::new(PortalConfig {
                host: "portal.example.com".to_string(),
                static_dir: static_dir.to_path_buf(),
            })),
            authenticator: Arc::new(OneUser),
            upstream: Upstream::new().unwrap(),
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    fn client() -> IpAddr {
        "203.0.113.5".parse().unwrap()
    }

    fn post_auth(body: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/auth")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_auth_success_whitelists_client() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let resp = handle(
            &state,
            post_auth(r#"{"username":"alice","key":"validpass123!"}"#),
            client(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "success");
        assert!(state.registry.check_only(client()));
    }

    #[tokio::test]
    async fn test_auth_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let cases = [
            ("not json", StatusCode::BAD_REQUEST),
            (r#"{"username":"alice"}"#, StatusCode::BAD_REQUEST),
            (r#"{"username":"al ice","key":"validpass123!"}"#, StatusCode::BAD_REQUEST),
            (r#"{"username":"alice","key":"short"}"#, StatusCode::BAD_REQUEST),
            (r#"{"username":"alice","key":"wrongpass1234"}"#, StatusCode::UNAUTHORIZED),
            (r#"{"username":"bob","key":"validpass123!"}"#, StatusCode::UNAUTHORIZED),
        ];
        for (body, expected) in cases {
            let resp = handle(&state, post_auth(body), client()).await;
            assert_eq!(resp.status(), expected, "body: {}", body);
        }
        assert!(!state.registry.check_only(client()));

        let get = Request::builder().uri("/auth").body(Body::empty()).unwrap();
        let resp = handle(&state, get, client()).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_serves_assets_and_rejects_unknown_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>portal</html>").unwrap();
        std::fs::write(dir.path().join("styles.css"), "body {}").unwrap();
        let state = state(dir.path());

        let get = |path: &str| Request::builder().uri(path).body(Body::empty()).unwrap();

        let resp = handle(&state, get("/"), client()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        assert_eq!(&body[..], b"<html>portal</html>");

        let resp = handle(&state, get("/styles.css/"), client()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = handle(&state, get("/index.html"), client()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

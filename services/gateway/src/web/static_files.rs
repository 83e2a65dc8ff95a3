//! File and directory routes.

use std::convert::Infallible;
use std::path::Path;

use axum::{
    body::Body,
    extract::Request,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tracing::error;

use super::ApiError;
use crate::proxy::RouteDescriptor;

/// Serve a static route: a single file, or a directory tree.
pub(crate) async fn serve_route(route: &RouteDescriptor, req: Request) -> Response {
    let root = Path::new(&route.target);
    let metadata = match tokio::fs::metadata(root).await {
        Ok(metadata) => metadata,
        Err(e) => {
            error!(path = %root.display(), error = %e, "Static route target unavailable");
            return ApiError::internal().into_response();
        }
    };

    let Some(req) = strip_request_prefix(req, route.flags.strip_prefix.as_deref()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let result = if metadata.is_dir() {
        ServeDir::new(root).oneshot(req).await
    } else {
        ServeFile::new(root).oneshot(req).await
    };
    into_response(result)
}

/// Serve one file regardless of the request path.
pub(crate) async fn serve_file(path: &Path, req: Request) -> Response {
    into_response(ServeFile::new(path).oneshot(req).await)
}

fn into_response<B>(result: Result<axum::http::Response<B>, Infallible>) -> Response
where
    B: hyper::body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    match result {
        Ok(resp) => resp.map(Body::new),
        Err(never) => match never {},
    }
}

/// Drop `prefix` from the request path. Requests outside the prefix get
/// `None`.
fn strip_request_prefix(mut req: Request, prefix: Option<&str>) -> Option<Request> {
    let Some(prefix) = prefix.filter(|prefix| !prefix.is_empty()) else {
        return Some(req);
    };

    let rest = req.uri().path().strip_prefix(prefix)?;
    let mut path_and_query = if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    };
    if let Some(query) = req.uri().query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    *req.uri_mut() = Uri::builder().path_and_query(path_and_query).build().ok()?;
    Some(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use crate::proxy::{Endpoint, RouteTable, TlsPolicy};

    fn get(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn table(target: &Path, strip_prefix: Option<&str>) -> RouteTable {
        let bind: SocketAddr = "0.0.0.0:80".parse().unwrap();
        let mut endpoint = Endpoint::web(
            bind,
            "files.example.com",
            "static",
            target.to_string_lossy(),
        );
        endpoint.strip_prefix = strip_prefix.map(str::to_string);
        RouteTable::build(&[endpoint], &TlsPolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_directory_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();

        let table = table(dir.path(), Some("/files"));
        let route = table.web_route(80, "files.example.com").unwrap();

        let resp = serve_route(route, get("/files/hello.txt")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "hello");

        let resp = serve_route(route, get("/files/missing.txt")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = serve_route(route, get("/elsewhere/hello.txt")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serves_single_file_for_any_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.html");
        std::fs::write(&file, "<h1>hi</h1>").unwrap();

        let table = table(&file, None);
        let route = table.web_route(80, "files.example.com").unwrap();

        let resp = serve_route(route, get("/any/path")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "<h1>hi</h1>");
    }

    #[tokio::test]
    async fn test_missing_target_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir.path().join("gone"), None);
        let route = table.web_route(80, "files.example.com").unwrap();

        let resp = serve_route(route, get("/")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

//! Front-door pages: the index, browser icons, and the optional `static/`
//! bundle under `--static-root`. Everything else belongs to the JSON API.

use anyhow::Result;
use axum::extract::Request;
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, get_service};
use axum::Router;
use std::path::{Path, PathBuf};
use tower_http::services::{ServeDir, ServeFile};

pub const FAVICON: &str = "favicon.ico";
pub const APPLE_TOUCH_ICON: &str = "apple-touch-icon.png";

const BUILTIN_INDEX: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>tileadder</title>
  </head>
  <body style="font-family: system-ui; padding: 24px">
    <h1>tileadder</h1>
    <ul>
      <li><a href="/add">Add maps</a> (requires <code>maps:add</code>)</li>
      <li><a href="/current">Current maps</a> (requires <code>maps:edit</code>)</li>
      <li><a href="/openapi.json">API description</a></li>
    </ul>
  </body>
</html>
"#;

async fn builtin_index() -> Html<&'static str> {
    Html(BUILTIN_INDEX)
}

async fn no_icon() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn cache_policy(path: &str) -> &'static str {
    match path {
        "/" | "/index.html" => "no-store",
        _ => "public, max-age=86400",
    }
}

async fn set_cache_control(req: Request, next: Next) -> Response {
    let policy = cache_policy(req.uri().path());
    let mut response = next.run(req).await;
    if response.status().is_success() && !response.headers().contains_key(CACHE_CONTROL) {
        response
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static(policy));
    }
    response
}

fn served_file(root: &Path, name: &str) -> Router {
    Router::new().route(
        &format!("/{name}"),
        get_service(ServeFile::new(root.join(name))),
    )
}

/// Routes for the pages the admin tool serves itself. Without a static root
/// the index is a built-in link page and the icons are absent.
pub fn router(static_root: Option<PathBuf>) -> Result<Router> {
    let Some(root) = static_root else {
        return Ok(Router::new()
            .route("/", get(builtin_index))
            .route(&format!("/{FAVICON}"), get(no_icon))
            .route(&format!("/{APPLE_TOUCH_ICON}"), get(no_icon)));
    };
    if !root.is_dir() {
        anyhow::bail!("static_root not found at {}", root.display());
    }

    let index = root.join("index.html");
    let router = Router::new()
        .route("/", get_service(ServeFile::new(&index)))
        .route("/index.html", get_service(ServeFile::new(&index)))
        .merge(served_file(&root, FAVICON))
        .merge(served_file(&root, APPLE_TOUCH_ICON))
        .nest_service("/static", ServeDir::new(root.join("static")))
        .layer(from_fn(set_cache_control));
    Ok(router)
}

//! Keeps a call's media-stream WebSocket on the instance that allocated its
//! Session, since Session state lives in-process and nowhere else.

use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

const LOCAL_SENTINEL: &str = "local";

/// Read the `{instance}` path segment from a media-stream upgrade URL and,
/// if it names a different instance than this one, short-circuit the
/// request with a replay directive before the WebSocket upgrade completes.
///
/// Must sit ahead of the upgrade route in the router's middleware stack —
/// once `ws.on_upgrade` runs there is no clean way to hand the connection
/// to a different host.
pub async fn route_by_affinity(instance_id: &str, req: Request, next: Next) -> Response {
    let Some(requested) = extract_instance(req.uri().path()) else {
        return next.run(req).await;
    };

    if requested == instance_id || requested == LOCAL_SENTINEL {
        return next.run(req).await;
    }

    tracing::info!(requested, instance_id, "replaying media-stream upgrade to owning instance");

    let mut response = (
        StatusCode::TEMPORARY_REDIRECT,
        format!("wrong instance, replay to {requested}"),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("instance={requested}")) {
        response.headers_mut().insert("fly-replay", value);
    }
    response
}

/// `/conversation/{agent}/media-stream/{instance}` → `{instance}`.
fn extract_instance(path: &str) -> Option<&str> {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next()? != "conversation" {
        return None;
    }
    let _agent = segments.next()?;
    if segments.next()? != "media-stream" {
        return None;
    }
    segments.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_instance_from_media_stream_path() {
        assert_eq!(
            extract_instance("/conversation/42/media-stream/iad-1"),
            Some("iad-1")
        );
    }

    #[test]
    fn non_media_stream_paths_are_not_matched() {
        assert_eq!(extract_instance("/health"), None);
        assert_eq!(extract_instance("/conversation/42/webhook"), None);
    }

    #[test]
    fn local_sentinel_is_recognized_by_callers() {
        assert_eq!(LOCAL_SENTINEL, "local");
    }
}

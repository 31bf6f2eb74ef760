use axum::{
    body::Body,
    http::{Request, Uri},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tracing::Span;

pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();

    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("UNKNOWN");

    let current_span = Span::current();

    current_span.record("http.uri", uri.path());
    current_span.record("http.host", host);
    if let Some(query) = uri.query() {
        current_span.record("http.query", query);
    }

    next.run(req).await
}

/// Redirect `/api/v1/flows/` to `/api/v1/flows`, keeping the query string.
pub async fn strip_trailing_slash(req: Request<Body>, next: Next) -> Response {
    match without_trailing_slash(req.uri()) {
        Some(target) => Redirect::permanent(&target).into_response(),
        None => next.run(req).await,
    }
}

fn without_trailing_slash(uri: &Uri) -> Option<String> {
    let path = uri.path().strip_suffix('/').filter(|p| !p.is_empty())?;
    Some(match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_target_keeps_query() {
        let uri: Uri = "/api/v1/executions/x1/stream/?fromIndex=4".parse().unwrap();
        assert_eq!(
            without_trailing_slash(&uri).as_deref(),
            Some("/api/v1/executions/x1/stream?fromIndex=4")
        );
    }

    #[test]
    fn test_root_and_clean_paths_pass_through() {
        assert!(without_trailing_slash(&"/".parse().unwrap()).is_none());
        assert!(without_trailing_slash(&"/api/v1/flows".parse().unwrap()).is_none());
    }
}

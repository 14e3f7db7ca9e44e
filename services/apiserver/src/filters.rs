// Scope filter pipeline.
//
// Stage A (`with_scope_extraction`) parses the scope selector out of the
// request without resolving it, so authorization on scope names can happen
// before any namespace sets are known. Stage B (`with_scope_resolution`)
// swaps the selector for the currently-published live mapping.
use crate::app::AppState;
use crate::error::{ApiError, api_bad_request, api_internal};
use crate::selectors::{FieldSelector, SelectorError};
use ambit_api::ScopeSelector;
use ambit_scope::ScopeMapping;
use axum::extract::{Request, State};
use axum::http::Uri;
use axum::http::uri::PathAndQuery;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use std::sync::Arc;
use url::form_urlencoded;

// Prefix of the path form `/scopes/<name>/<value>/<rest>`.
const SCOPE_PATH_PREFIX: &str = "/scopes/";
const SCOPE_QUERY_PARAM: &str = "scope";
const FIELD_SELECTOR_PARAM: &str = "fieldSelector";

/// Stage A: extract the scope selector (query, path, or field selector
/// form) into a request extension and scrub it from the request. Requests
/// without a scope source pass through untouched.
pub async fn with_scope_extraction(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match extract_scope(request, &state.default_scope_name) {
        Ok(request) => next.run(request).await,
        Err(err) => {
            counter!("ambit_scope_extraction_rejected_total").increment(1);
            err.into_response()
        }
    }
}

/// Stage B: resolve the extracted selector into a live mapping. An unknown
/// scope is an internal error: the client learned the scope from somewhere,
/// so a retry will succeed once this server's caches sync.
pub async fn with_scope_resolution(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(selector) = request.extensions().get::<ScopeSelector>().cloned() else {
        return next.run(request).await;
    };
    let Some(resolver) = state.resolver.clone() else {
        return next.run(request).await;
    };
    match resolver.resolve(selector.name(), selector.value()).await {
        Ok(mapping) => {
            request.extensions_mut().insert::<Arc<ScopeMapping>>(mapping);
            next.run(request).await
        }
        Err(err) => {
            tracing::error!(scope = %selector, error = %err, "resolving scope to namespace set failed");
            api_internal(&format!("resolving scope to namespace set: {err}")).into_response()
        }
    }
}

fn extract_scope(mut request: Request, default_scope_name: &str) -> Result<Request, ApiError> {
    let uri = request.uri().clone();
    let raw_path = uri.path().to_string();
    let query_pairs: Vec<(String, String)> =
        form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
            .into_owned()
            .collect();

    // Query form: ?scope=<value>, name defaults to the well-known name.
    let query_value = query_pairs
        .iter()
        .find(|(key, value)| key == SCOPE_QUERY_PARAM && !value.is_empty())
        .map(|(_, value)| value.clone());

    // Field selector form: scopes.k8s.io/<name>=<value>.
    let mut field_selector = match query_pairs
        .iter()
        .find(|(key, _)| key == FIELD_SELECTOR_PARAM)
    {
        Some((_, raw)) => Some(FieldSelector::parse(raw).map_err(selector_error)?),
        None => None,
    };
    let field_scope = match field_selector.as_mut() {
        Some(selector) => selector.take_scope_selector().map_err(selector_error)?,
        None => None,
    };

    // Path form: /scopes/<name>/<value>/<rest>.
    let path_scope = if raw_path == "/scopes" || raw_path.starts_with(SCOPE_PATH_PREFIX) {
        Some(parse_scope_path(&raw_path)?)
    } else {
        None
    };

    let sources = usize::from(query_value.is_some())
        + usize::from(field_scope.is_some())
        + usize::from(path_scope.is_some());
    if sources > 1 {
        return Err(api_bad_request(
            "cannot specify more than one scope source in a request",
        ));
    }
    if sources == 0 {
        return Ok(request);
    }

    let mut new_path: Option<String> = None;
    let selector = if let Some(value) = query_value {
        ScopeSelector::new(default_scope_name, &value)
            .map_err(|_| api_bad_request("invalid scope specified in the request URL"))?
    } else if let Some(selector) = field_scope {
        selector
    } else {
        let (selector, rest) = path_scope.expect("path scope counted as a source");
        new_path = Some(rest);
        selector
    };

    // Rebuild the request URI: the path form drops its prefix, the field
    // selector form drops the scope entry. Downstream handlers see no trace
    // of the scope source.
    let path = new_path.unwrap_or(raw_path);
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &query_pairs {
        if key == FIELD_SELECTOR_PARAM {
            match &field_selector {
                Some(rewritten) if !rewritten.is_empty() => {
                    serializer.append_pair(key, &rewritten.to_string());
                }
                Some(_) => {}
                None => {
                    serializer.append_pair(key, value);
                }
            }
            continue;
        }
        serializer.append_pair(key, value);
    }
    let query = serializer.finish();
    let path_and_query = if query.is_empty() {
        path
    } else {
        format!("{path}?{query}")
    };
    let path_and_query = path_and_query
        .parse::<PathAndQuery>()
        .map_err(|_| api_internal("failed to rewrite scoped request target"))?;
    let mut parts = uri.into_parts();
    parts.path_and_query = Some(path_and_query);
    *request.uri_mut() =
        Uri::from_parts(parts).map_err(|_| api_internal("failed to rewrite scoped request target"))?;

    request.extensions_mut().insert(selector);
    Ok(request)
}

// Parses `/scopes/<name>/<value>/<rest>` into a selector and the rewritten
// path `/<rest>`.
fn parse_scope_path(path: &str) -> Result<(ScopeSelector, String), ApiError> {
    let rest = path
        .strip_prefix(SCOPE_PATH_PREFIX)
        .ok_or_else(|| api_bad_request("invalid scoped request path"))?;
    let (name, tail) = rest
        .split_once('/')
        .ok_or_else(|| api_bad_request("invalid scoped request path"))?;
    if name.is_empty() {
        return Err(api_bad_request("no scope name specified"));
    }
    // `/scopes/<name>` and `/scopes/<name>/<value>` have no value or no
    // request path to forward to.
    let Some((value, remainder)) = tail.split_once('/') else {
        return Err(api_bad_request("invalid scoped request path"));
    };
    if value.is_empty() {
        return Err(api_bad_request("invalid scoped request path"));
    }
    let selector = ScopeSelector::new(name, value)
        .map_err(|_| api_bad_request("invalid scoped request path"))?;
    Ok((selector, format!("/{remainder}")))
}

fn selector_error(err: SelectorError) -> ApiError {
    api_bad_request(&err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(uri: &str) -> Request {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    fn extracted(uri: &str) -> Request {
        extract_scope(request(uri), "internal.apiserver.k8s.io").expect("extract")
    }

    #[test]
    fn no_scope_source_passes_through() {
        let req = extracted("/apis/core/pods?labelSelector=app%3Dfoo");
        assert!(req.extensions().get::<ScopeSelector>().is_none());
        assert_eq!(req.uri().path(), "/apis/core/pods");
    }

    #[test]
    fn query_form_uses_the_default_name() {
        let req = extracted("/apis/core/pods?scope=alpha");
        let selector = req.extensions().get::<ScopeSelector>().expect("selector");
        assert_eq!(selector.name(), "internal.apiserver.k8s.io");
        assert_eq!(selector.value(), "alpha");
    }

    #[test]
    fn path_form_rewrites_the_path() {
        let req = extracted("/scopes/workspace/alpha/apis/core/pods");
        let selector = req.extensions().get::<ScopeSelector>().expect("selector");
        assert_eq!(selector.name(), "workspace");
        assert_eq!(selector.value(), "alpha");
        assert_eq!(req.uri().path(), "/apis/core/pods");
    }

    #[test]
    fn path_form_error_messages_are_deterministic() {
        let err = extract_scope(
            request("/scopes//alpha/apis/core/pods"),
            "internal.apiserver.k8s.io",
        )
        .expect_err("no name");
        assert_eq!(err.body.message, "no scope name specified");

        let err = extract_scope(request("/scopes/workspace/"), "internal.apiserver.k8s.io")
            .expect_err("no value");
        assert_eq!(err.body.message, "invalid scoped request path");

        let err = extract_scope(request("/scopes/workspace"), "internal.apiserver.k8s.io")
            .expect_err("no value or rest");
        assert_eq!(err.body.message, "invalid scoped request path");
    }

    #[test]
    fn field_selector_form_is_extracted_and_scrubbed() {
        let req = extracted(
            "/apis/core/pods?fieldSelector=metadata.name%3Dfoo,scopes.k8s.io%2Fworkspace%3Dalpha",
        );
        let selector = req.extensions().get::<ScopeSelector>().expect("selector");
        assert_eq!(selector.name(), "workspace");
        assert_eq!(selector.value(), "alpha");
        let query = req.uri().query().expect("query");
        assert!(query.contains("fieldSelector"));
        assert!(!query.contains("scopes.k8s.io"));
    }

    #[test]
    fn field_selector_with_only_the_scope_entry_is_removed() {
        let req = extracted("/apis/core/pods?fieldSelector=scopes.k8s.io%2Fworkspace%3Dalpha");
        assert!(req.extensions().get::<ScopeSelector>().is_some());
        assert!(req.uri().query().unwrap_or("").is_empty());
    }

    #[test]
    fn multiple_sources_fail_with_bad_request() {
        let err = extract_scope(
            request("/scopes/workspace/alpha/apis/core/pods?scope=beta"),
            "internal.apiserver.k8s.io",
        )
        .expect_err("two sources");
        assert_eq!(
            err.body.message,
            "cannot specify more than one scope source in a request"
        );

        let err = extract_scope(
            request("/apis/core/pods?scope=beta&fieldSelector=scopes.k8s.io%2Fworkspace%3Dalpha"),
            "internal.apiserver.k8s.io",
        )
        .expect_err("query and field");
        assert_eq!(
            err.body.message,
            "cannot specify more than one scope source in a request"
        );
    }

    #[test]
    fn multiple_scope_field_entries_fail() {
        let err = extract_scope(
            request(
                "/apis/core/pods?fieldSelector=scopes.k8s.io%2Fworkspace%3Dalpha,scopes.k8s.io%2Fenv%3Dprod",
            ),
            "internal.apiserver.k8s.io",
        )
        .expect_err("two entries");
        assert_eq!(
            err.body.message,
            "cannot specify more than one scopes.k8s.io field selector"
        );
    }
}

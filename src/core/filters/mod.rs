//! Built-in gateway filters.
//!
//! The resilience filters (`retry`, `circuit_breaker`, `rate_limit`) wrap the
//! remainder of the chain; `basic` holds the stateless request and response
//! transforms; `forward` holds the route-to-URL step and the terminal
//! forwarder.
use std::{borrow::Cow, collections::HashMap};

use http::{Uri, uri::PathAndQuery};

use crate::core::error::{GatewayError, GatewayResult};

pub mod basic;
pub mod circuit_breaker;
pub mod forward;
pub mod rate_limit;
pub mod retry;
pub mod status;

pub use status::StatusSelector;

/// Replace `{name}` placeholders with the percent-decoded template
/// variables. Unknown placeholders are left as they are.
pub fn expand_template(template: &str, variables: &HashMap<String, String>) -> String {
    expand_with(template, variables, |raw| {
        urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
    })
}

/// Like [`expand_template`], but inserts the variables exactly as they were
/// captured from the request, so the result stays a valid encoded path and an
/// encoded `/` never becomes a segment separator.
pub fn expand_path_template(template: &str, variables: &HashMap<String, String>) -> String {
    expand_with(template, variables, Cow::Borrowed)
}

fn expand_with<'v>(
    template: &str,
    variables: &'v HashMap<String, String>,
    render: impl Fn(&'v str) -> Cow<'v, str>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find('}') {
            Some(end) => {
                let name = &tail[1..end];
                match variables.get(name) {
                    Some(value) => out.push_str(&render(value)),
                    None => out.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// `uri` with its path replaced. The query is kept unless `path` carries
/// its own.
pub(crate) fn with_path(uri: &Uri, path: &str) -> GatewayResult<Uri> {
    let path_and_query = match (path.contains('?'), uri.query()) {
        (false, Some(query)) => format!("{path}?{query}"),
        _ => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        PathAndQuery::try_from(path_and_query.as_str())
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid path '{path}': {e}")))?,
    );
    Uri::from_parts(parts)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid path '{path}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_template() {
        let vars = HashMap::from([("id".to_string(), "42".to_string())]);
        assert_eq!(expand_template("/items/{id}/detail", &vars), "/items/42/detail");
        assert_eq!(expand_template("/x/{missing}", &vars), "/x/{missing}");
        assert_eq!(expand_template("/open{brace", &vars), "/open{brace");
    }

    #[test]
    fn test_header_expansion_decodes_and_path_expansion_does_not() {
        let vars = HashMap::from([
            ("name".to_string(), "j%20x".to_string()),
            ("bad".to_string(), "%zz".to_string()),
        ]);
        assert_eq!(expand_template("{name}", &vars), "j x");
        assert_eq!(expand_template("{bad}", &vars), "%zz");
        assert_eq!(expand_path_template("/u/{name}", &vars), "/u/j%20x");
    }

    #[test]
    fn test_with_path_keeps_query() {
        let uri = Uri::from_static("/old/path?a=1");
        assert_eq!(with_path(&uri, "/new").unwrap(), "/new?a=1");
        assert_eq!(with_path(&uri, "/new?b=2").unwrap(), "/new?b=2");

        let absolute = Uri::from_static("http://backend:8080/old");
        assert_eq!(
            with_path(&absolute, "/new").unwrap(),
            "http://backend:8080/new"
        );
    }
}

//! Path and host templates compiled to anchored regular expressions.
//!
//! Supported syntax: `{name}` binds one segment, `{name:regex}` binds a
//! segment matching `regex`, `{*name}` binds the remainder of a path
//! (including its leading slash), `*` matches within a segment, `**` matches
//! across segments and `?` matches a single character.
use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("unbalanced braces in pattern '{0}'")]
    Unbalanced(String),

    #[error("invalid pattern '{pattern}': {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A compiled request path template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    pub fn parse(pattern: &str, match_trailing_slash: bool) -> Result<Self, PatternError> {
        let mut body = translate(pattern, '/')?;
        if match_trailing_slash && !pattern.ends_with('/') {
            body.push_str("/?");
        }
        Ok(Self {
            source: pattern.to_string(),
            regex: compile(pattern, &format!("^{body}$"))?,
        })
    }

    /// Template variables bound by a successful match.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        captures(&self.regex, path)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// A compiled `Host` template. Matching ignores case.
#[derive(Debug, Clone)]
pub struct HostPattern {
    source: String,
    regex: Regex,
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let body = translate(pattern, '.')?;
        Ok(Self {
            source: pattern.to_string(),
            regex: compile(pattern, &format!("(?i)^{body}$"))?,
        })
    }

    pub fn matches(&self, host: &str) -> Option<HashMap<String, String>> {
        captures(&self.regex, host)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn compile(pattern: &str, regex: &str) -> Result<Regex, PatternError> {
    Regex::new(regex).map_err(|source| PatternError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

fn captures(regex: &Regex, input: &str) -> Option<HashMap<String, String>> {
    let caps = regex.captures(input)?;
    let mut variables = HashMap::new();
    for name in regex.capture_names().flatten() {
        if let Some(value) = caps.name(name) {
            variables.insert(name.to_string(), value.as_str().to_string());
        }
    }
    Some(variables)
}

fn translate(pattern: &str, separator: char) -> Result<String, PatternError> {
    let segment = format!("[^{}]", regex::escape(&separator.to_string()));
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut depth = 1;
                let mut inner = String::new();
                loop {
                    let Some(c) = chars.next() else {
                        return Err(PatternError::Unbalanced(pattern.to_string()));
                    };
                    match c {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    inner.push(c);
                }

                if let Some(name) = inner.strip_prefix('*') {
                    if separator == '/' && out.ends_with('/') {
                        out.pop();
                        out.push_str(&format!("(?P<{name}>(?:/.*)?)"));
                    } else {
                        out.push_str(&format!("(?P<{name}>.*)"));
                    }
                } else if let Some((name, regex)) = inner.split_once(':') {
                    out.push_str(&format!("(?P<{name}>{regex})"));
                } else {
                    out.push_str(&format!("(?P<{inner}>{segment}+)"));
                }
            }
            '}' => return Err(PatternError::Unbalanced(pattern.to_string())),
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if separator == '/' && out.ends_with('/') && chars.peek().is_none() {
                    out.pop();
                    out.push_str("(?:/.*)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => {
                out.push_str(&segment);
                out.push('*');
            }
            '?' => out.push_str(&segment),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_variables() {
        let pattern = PathPattern::parse("/a/{id}/b", true).unwrap();
        let vars = pattern.matches("/a/42/b").unwrap();
        assert_eq!(vars.get("id").map(String::as_str), Some("42"));
        assert!(pattern.matches("/a/42/b/").is_some());
        assert!(pattern.matches("/a/42/43/b").is_none());
    }

    #[test]
    fn test_trailing_slash_can_be_disabled() {
        let pattern = PathPattern::parse("/red/{segment}", false).unwrap();
        assert!(pattern.matches("/red/blue").is_some());
        assert!(pattern.matches("/red/blue/").is_none());
    }

    #[test]
    fn test_regex_constrained_variable() {
        let pattern = PathPattern::parse("/orders/{id:[0-9]{2,4}}", true).unwrap();
        assert!(pattern.matches("/orders/123").is_some());
        assert!(pattern.matches("/orders/abc").is_none());
        assert!(pattern.matches("/orders/1").is_none());
    }

    #[test]
    fn test_wildcards() {
        let pattern = PathPattern::parse("/static/**", true).unwrap();
        assert!(pattern.matches("/static").is_some());
        assert!(pattern.matches("/static/css/site.css").is_some());
        assert!(pattern.matches("/statics").is_none());

        let pattern = PathPattern::parse("/files/*.txt", true).unwrap();
        assert!(pattern.matches("/files/a.txt").is_some());
        assert!(pattern.matches("/files/dir/a.txt").is_none());

        let pattern = PathPattern::parse("/v?/items", true).unwrap();
        assert!(pattern.matches("/v1/items").is_some());
        assert!(pattern.matches("/v10/items").is_none());
    }

    #[test]
    fn test_catch_all_variable() {
        let pattern = PathPattern::parse("/proxy/{*rest}", true).unwrap();
        let vars = pattern.matches("/proxy/a/b").unwrap();
        assert_eq!(vars.get("rest").map(String::as_str), Some("/a/b"));
        let vars = pattern.matches("/proxy").unwrap();
        assert_eq!(vars.get("rest").map(String::as_str), Some(""));
    }

    #[test]
    fn test_variables_keep_percent_encoding() {
        let pattern = PathPattern::parse("/users/{name}", true).unwrap();
        let vars = pattern.matches("/users/j%C3%B6rg").unwrap();
        assert_eq!(vars.get("name").map(String::as_str), Some("j%C3%B6rg"));
        let vars = pattern.matches("/users/..%2F..%2Fadmin").unwrap();
        assert_eq!(vars.get("name").map(String::as_str), Some("..%2F..%2Fadmin"));
    }

    #[test]
    fn test_literal_characters_are_escaped() {
        let pattern = PathPattern::parse("/a.b", false).unwrap();
        assert!(pattern.matches("/a.b").is_some());
        assert!(pattern.matches("/axb").is_none());
    }

    #[test]
    fn test_host_patterns() {
        let pattern = HostPattern::parse("{sub}.example.org").unwrap();
        let vars = pattern.matches("API.example.org").unwrap();
        assert_eq!(vars.get("sub").map(String::as_str), Some("API"));
        assert!(pattern.matches("a.b.example.org").is_none());

        let pattern = HostPattern::parse("**.example.org").unwrap();
        assert!(pattern.matches("a.b.example.org").is_some());
        assert!(pattern.matches("example.com").is_none());
    }

    #[test]
    fn test_unbalanced_braces_are_rejected() {
        assert!(matches!(
            PathPattern::parse("/a/{id", true),
            Err(PatternError::Unbalanced(_))
        ));
        assert!(PathPattern::parse("/a/id}", true).is_err());
    }
}

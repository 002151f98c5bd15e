//! Built-in predicate atoms and the flat argument structs they are built from.
use std::{collections::HashMap, net::IpAddr};

use chrono::{DateTime, Utc};
use http::{HeaderName, Method};
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::Deserialize;

use crate::core::{
    exchange::Exchange,
    predicate::{
        RoutePredicate,
        pattern::{HostPattern, PathPattern},
    },
};

fn default_true() -> bool {
    true
}

/// Compile `pattern` so that it must match the whole input.
fn full_match(pattern: &str) -> Result<Regex, String> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| format!("invalid regexp '{pattern}': {e}"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathArgs {
    pub patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub match_trailing_slash: bool,
}

pub struct PathPredicate {
    patterns: Vec<PathPattern>,
}

impl PathPredicate {
    pub fn new(args: &PathArgs) -> Result<Self, String> {
        if args.patterns.is_empty() {
            return Err("at least one path pattern is required".to_string());
        }
        let patterns = args
            .patterns
            .iter()
            .map(|p| PathPattern::parse(p, args.match_trailing_slash))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        Ok(Self { patterns })
    }
}

impl RoutePredicate for PathPredicate {
    fn test(&self, exchange: &Exchange, variables: &mut HashMap<String, String>) -> bool {
        let path = exchange.request().path();
        for pattern in &self.patterns {
            if let Some(bound) = pattern.matches(path) {
                variables.extend(bound);
                return true;
            }
        }
        false
    }

    fn describe(&self) -> String {
        let patterns: Vec<_> = self.patterns.iter().map(PathPattern::as_str).collect();
        format!("Paths: {patterns:?}")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostArgs {
    pub patterns: Vec<String>,
}

pub struct HostPredicate {
    patterns: Vec<HostPattern>,
}

impl HostPredicate {
    pub fn new(args: &HostArgs) -> Result<Self, String> {
        if args.patterns.is_empty() {
            return Err("at least one host pattern is required".to_string());
        }
        let patterns = args
            .patterns
            .iter()
            .map(|p| HostPattern::parse(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        Ok(Self { patterns })
    }
}

impl RoutePredicate for HostPredicate {
    fn test(&self, exchange: &Exchange, variables: &mut HashMap<String, String>) -> bool {
        let Some(host) = exchange.request().host() else {
            return false;
        };
        for pattern in &self.patterns {
            if let Some(bound) = pattern.matches(host) {
                variables.extend(bound);
                return true;
            }
        }
        false
    }

    fn describe(&self) -> String {
        let patterns: Vec<_> = self.patterns.iter().map(HostPattern::as_str).collect();
        format!("Hosts: {patterns:?}")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MethodArgs {
    pub methods: Vec<String>,
}

pub struct MethodPredicate {
    methods: Vec<Method>,
}

impl MethodPredicate {
    pub fn new(args: &MethodArgs) -> Result<Self, String> {
        let methods = args
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|e| format!("invalid method '{m}': {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { methods })
    }
}

impl RoutePredicate for MethodPredicate {
    fn test(&self, exchange: &Exchange, _variables: &mut HashMap<String, String>) -> bool {
        self.methods.contains(&exchange.request().method)
    }

    fn describe(&self) -> String {
        let methods: Vec<_> = self.methods.iter().map(Method::as_str).collect();
        format!("Methods: {methods:?}")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderArgs {
    pub header: String,
    #[serde(default)]
    pub regexp: Option<String>,
}

/// Matches when any value of the header fully matches `regexp`, or when the
/// header is present and no `regexp` is configured.
pub struct HeaderPredicate {
    name: HeaderName,
    regexp: Option<Regex>,
}

impl HeaderPredicate {
    pub fn new(args: &HeaderArgs) -> Result<Self, String> {
        let name = HeaderName::from_bytes(args.header.as_bytes())
            .map_err(|e| format!("invalid header name '{}': {e}", args.header))?;
        let regexp = args.regexp.as_deref().map(full_match).transpose()?;
        Ok(Self { name, regexp })
    }
}

impl RoutePredicate for HeaderPredicate {
    fn test(&self, exchange: &Exchange, _variables: &mut HashMap<String, String>) -> bool {
        let mut values = exchange.request().headers.get_all(&self.name).iter().peekable();
        match &self.regexp {
            None => values.peek().is_some(),
            Some(regexp) => values
                .filter_map(|v| v.to_str().ok())
                .any(|v| regexp.is_match(v)),
        }
    }

    fn describe(&self) -> String {
        match &self.regexp {
            Some(regexp) => format!("Header: {} regexp={}", self.name, regexp.as_str()),
            None => format!("Header: {}", self.name),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryArgs {
    pub param: String,
    #[serde(default)]
    pub regexp: Option<String>,
}

pub struct QueryPredicate {
    param: String,
    regexp: Option<Regex>,
}

impl QueryPredicate {
    pub fn new(args: &QueryArgs) -> Result<Self, String> {
        if args.param.is_empty() {
            return Err("query parameter name must not be empty".to_string());
        }
        Ok(Self {
            param: args.param.clone(),
            regexp: args.regexp.as_deref().map(full_match).transpose()?,
        })
    }
}

impl RoutePredicate for QueryPredicate {
    fn test(&self, exchange: &Exchange, _variables: &mut HashMap<String, String>) -> bool {
        let params = exchange.request().query_params();
        let mut values = params
            .iter()
            .filter(|(name, _)| *name == self.param)
            .map(|(_, value)| value.as_str())
            .peekable();
        match &self.regexp {
            None => values.peek().is_some(),
            Some(regexp) => values.any(|v| regexp.is_match(v)),
        }
    }

    fn describe(&self) -> String {
        format!("Query: param={} regexp={:?}", self.param, self.regexp.as_ref().map(Regex::as_str))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CookieArgs {
    pub name: String,
    pub regexp: String,
}

pub struct CookiePredicate {
    name: String,
    regexp: Regex,
}

impl CookiePredicate {
    pub fn new(args: &CookieArgs) -> Result<Self, String> {
        Ok(Self {
            name: args.name.clone(),
            regexp: full_match(&args.regexp)?,
        })
    }
}

impl RoutePredicate for CookiePredicate {
    fn test(&self, exchange: &Exchange, _variables: &mut HashMap<String, String>) -> bool {
        exchange
            .request()
            .cookies()
            .any(|(name, value)| name == self.name && self.regexp.is_match(value))
    }

    fn describe(&self) -> String {
        format!("Cookie: name={} regexp={}", self.name, self.regexp.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstantArgs {
    pub datetime: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BetweenArgs {
    pub datetime1: DateTime<Utc>,
    pub datetime2: DateTime<Utc>,
}

/// Time window atom. Bounds are exclusive.
#[derive(Debug, Clone)]
pub enum TimePredicate {
    After(DateTime<Utc>),
    Before(DateTime<Utc>),
    Between(DateTime<Utc>, DateTime<Utc>),
}

impl TimePredicate {
    pub fn between(args: &BetweenArgs) -> Result<Self, String> {
        if args.datetime1 >= args.datetime2 {
            return Err(format!(
                "datetime1 ({}) must be before datetime2 ({})",
                args.datetime1, args.datetime2
            ));
        }
        Ok(TimePredicate::Between(args.datetime1, args.datetime2))
    }

    fn contains(&self, now: DateTime<Utc>) -> bool {
        match self {
            TimePredicate::After(start) => now > *start,
            TimePredicate::Before(end) => now < *end,
            TimePredicate::Between(start, end) => now > *start && now < *end,
        }
    }
}

impl RoutePredicate for TimePredicate {
    fn test(&self, _exchange: &Exchange, _variables: &mut HashMap<String, String>) -> bool {
        self.contains(Utc::now())
    }

    fn describe(&self) -> String {
        match self {
            TimePredicate::After(t) => format!("After: {}", t.to_rfc3339()),
            TimePredicate::Before(t) => format!("Before: {}", t.to_rfc3339()),
            TimePredicate::Between(a, b) => {
                format!("Between: {} and {}", a.to_rfc3339(), b.to_rfc3339())
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAddrArgs {
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardedRemoteAddrArgs {
    pub sources: Vec<String>,
    #[serde(default = "default_trusted_index")]
    pub max_trusted_index: usize,
}

fn default_trusted_index() -> usize {
    1
}

/// Where the client address is taken from.
#[derive(Debug, Clone, Copy)]
pub enum AddressSource {
    /// Peer address of the inbound connection.
    Peer,
    /// `X-Forwarded-For`, counting `max_trusted_index` entries from the right.
    Forwarded { max_trusted_index: usize },
}

pub struct RemoteAddrPredicate {
    sources: Vec<IpNetwork>,
    resolver: AddressSource,
}

fn parse_sources(sources: &[String]) -> Result<Vec<IpNetwork>, String> {
    if sources.is_empty() {
        return Err("at least one source network is required".to_string());
    }
    sources
        .iter()
        .map(|s| {
            s.parse::<IpNetwork>()
                .map_err(|e| format!("invalid source '{s}': {e}"))
        })
        .collect()
}

impl RemoteAddrPredicate {
    pub fn new(args: &RemoteAddrArgs) -> Result<Self, String> {
        Ok(Self {
            sources: parse_sources(&args.sources)?,
            resolver: AddressSource::Peer,
        })
    }

    pub fn forwarded(args: &ForwardedRemoteAddrArgs) -> Result<Self, String> {
        if args.max_trusted_index == 0 {
            return Err("max_trusted_index must be greater than 0".to_string());
        }
        Ok(Self {
            sources: parse_sources(&args.sources)?,
            resolver: AddressSource::Forwarded {
                max_trusted_index: args.max_trusted_index,
            },
        })
    }

    fn client_ip(&self, exchange: &Exchange) -> Option<IpAddr> {
        let request = exchange.request();
        match self.resolver {
            AddressSource::Peer => request.remote_addr.map(|addr| addr.ip()),
            AddressSource::Forwarded { max_trusted_index } => {
                let entries: Vec<&str> = request
                    .headers
                    .get_all("x-forwarded-for")
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .flat_map(|v| v.split(','))
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .collect();
                let entry = match entries.len().checked_sub(max_trusted_index) {
                    Some(index) => entries.get(index),
                    None => entries.first(),
                }?;
                entry.parse().ok()
            }
        }
    }
}

impl RoutePredicate for RemoteAddrPredicate {
    fn test(&self, exchange: &Exchange, _variables: &mut HashMap<String, String>) -> bool {
        match self.client_ip(exchange) {
            Some(ip) => self.sources.iter().any(|net| net.contains(ip)),
            None => false,
        }
    }

    fn describe(&self) -> String {
        let sources: Vec<_> = self.sources.iter().map(ToString::to_string).collect();
        match self.resolver {
            AddressSource::Peer => format!("RemoteAddrs: {sources:?}"),
            AddressSource::Forwarded { max_trusted_index } => {
                format!("XForwardedRemoteAddrs: {sources:?} max_trusted_index={max_trusted_index}")
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightArgs {
    pub group: String,
    pub weight: u32,
}

/// Matches when the exchange's draw for `group` picked this route.
pub struct WeightPredicate {
    group: String,
    route_id: String,
}

impl WeightPredicate {
    pub fn new(group: impl Into<String>, route_id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            route_id: route_id.into(),
        }
    }
}

impl RoutePredicate for WeightPredicate {
    fn test(&self, exchange: &Exchange, _variables: &mut HashMap<String, String>) -> bool {
        exchange
            .attributes()
            .weights
            .get(&self.group)
            .is_some_and(|chosen| *chosen == self.route_id)
    }

    fn describe(&self) -> String {
        format!("Weight: group={} route={}", self.group, self.route_id)
    }
}

use std::{collections::HashSet, net::SocketAddr, time::Duration};

use crate::{
    config::models::{GatewayConfig, RateLimiterStoreConfig, RouteDefinition},
    core::{predicate::weight::WeightTable, registry::Registry},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Duplicate route id '{id}'")]
    DuplicateRouteId { id: String },

    #[error("Invalid route: {message}")]
    InvalidRoute { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator.
///
/// Route predicates and filters are built through the registry, so unknown
/// names and bad arguments are caught before the gateway starts. All
/// problems are collected and reported together.
pub struct ConfigValidator<'a> {
    registry: &'a Registry,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Validate the entire gateway configuration
    pub fn validate(&self, config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        let mut seen = HashSet::new();
        for route in &config.routes {
            if route.id.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "routes[].id".to_string(),
                });
            } else if !seen.insert(route.id.as_str()) {
                errors.push(ValidationError::DuplicateRouteId {
                    id: route.id.clone(),
                });
            }
            errors.extend(self.validate_route(route));
        }

        if !config.default_filters.is_empty() {
            let probe = RouteDefinition {
                id: "default_filters".to_string(),
                uri: "http://localhost".to_string(),
                order: 0,
                predicates: Vec::new(),
                filters: config.default_filters.clone(),
                metadata: Default::default(),
            };
            if let Err(e) = self
                .registry
                .build_route(&probe, &[], &mut WeightTable::default())
            {
                errors.push(ValidationError::InvalidRoute {
                    message: e.to_string(),
                });
            }
        }

        for (field, value) in [
            ("refresh.debounce", config.refresh.debounce),
            ("refresh.poll_interval", config.refresh.poll_interval),
            ("http_client.connect_timeout", config.http_client.connect_timeout),
        ] {
            if let Err(e) = Self::validate_positive(field, value) {
                errors.push(e);
            }
        }

        match &config.rate_limiter {
            RateLimiterStoreConfig::Redis { url } => {
                if let Err(e) = Self::validate_redis_url(url) {
                    errors.push(e);
                }
            }
            RateLimiterStoreConfig::InMemory { idle_timeout } => {
                if let Err(e) = Self::validate_positive("rate_limiter.idle_timeout", *idle_timeout)
                {
                    errors.push(e);
                }
            }
        }

        if config.management.enabled && !config.management.base_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "management.base_path".to_string(),
                message: "Must start with '/'".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Validate one route: its URI, then every predicate and filter by
    /// building it.
    fn validate_route(&self, route: &RouteDefinition) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Err(e) = Self::validate_url(&route.uri, &format!("route '{}' uri", route.id)) {
            errors.push(e);
            return errors;
        }
        if let Err(e) = self
            .registry
            .build_route(route, &[], &mut WeightTable::default())
        {
            errors.push(ValidationError::InvalidRoute {
                message: e.to_string(),
            });
        }
        errors
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_redis_url(url_str: &str) -> ValidationResult<()> {
        let field = "rate_limiter.url".to_string();
        match url::Url::parse(url_str) {
            Ok(url) if matches!(url.scheme(), "redis" | "rediss") => Ok(()),
            Ok(url) => Err(ValidationError::InvalidField {
                field,
                message: format!("URL scheme must be 'redis' or 'rediss', got '{}'", url.scheme()),
            }),
            Err(e) => Err(ValidationError::InvalidField {
                field,
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_positive(field: &str, value: Duration) -> ValidationResult<()> {
        if value.is_zero() {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

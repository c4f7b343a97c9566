use std::collections::HashSet;

use url::Url;

use crate::config::models::{EnvironmentConfig, RateLimitConfig, RouteConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ConfigError>;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Configuration object cannot be null or undefined.")]
    Empty,

    #[error("Environment configuration not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Routes configuration must be a non-empty array")]
    EmptyRoutes,

    #[error("Route at index {index} must have both prefix and target")]
    IncompleteRoute { index: usize },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Duplicate route prefix '{prefix}'")]
    DuplicatePrefix { prefix: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Environment configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate an environment configuration, reporting every problem found.
    pub fn validate(config: &EnvironmentConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        let required = [
            ("port", config.port.is_some()),
            ("corsOptions", config.cors_options.is_some()),
            ("routes", config.routes.is_some()),
        ];
        for (field, present) in required {
            if !present {
                errors.push(ConfigError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        if config.port == Some(0) {
            errors.push(ConfigError::InvalidField {
                field: "port".to_string(),
                message: "Port must be between 1 and 65535".to_string(),
            });
        }

        if let Err(e) = Self::validate_rate_limit(&config.rate_limit, "rateLimit") {
            errors.push(e);
        }

        if config.timeout == 0 {
            errors.push(ConfigError::InvalidField {
                field: "timeout".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        let cb = &config.circuit_breaker;
        if !(0.0..=100.0).contains(&cb.error_threshold_percentage) {
            errors.push(ConfigError::InvalidField {
                field: "circuitBreaker.errorThresholdPercentage".to_string(),
                message: "Must be between 0 and 100".to_string(),
            });
        }
        if cb.rolling_count_buckets == 0 || cb.rolling_count_timeout_ms == 0 {
            errors.push(ConfigError::InvalidField {
                field: "circuitBreaker".to_string(),
                message: "Rolling window and bucket count must be greater than 0".to_string(),
            });
        }

        if let Some(routes) = &config.routes {
            if routes.is_empty() {
                errors.push(ConfigError::EmptyRoutes);
            }
            let mut seen = HashSet::new();
            for (index, route) in routes.iter().enumerate() {
                if let Err(mut route_errors) = Self::validate_single_route(index, route) {
                    errors.append(&mut route_errors);
                }
                if let Some(prefix) = &route.prefix
                    && !seen.insert(prefix.as_str())
                {
                    errors.push(ConfigError::DuplicatePrefix {
                        prefix: prefix.clone(),
                    });
                }
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            }),
        }
    }

    /// Validate a single route configuration
    fn validate_single_route(index: usize, route: &RouteConfig) -> Result<(), Vec<ConfigError>> {
        let (Some(prefix), Some(target)) = (&route.prefix, &route.target) else {
            return Err(vec![ConfigError::IncompleteRoute { index }]);
        };

        let mut errors = Vec::new();

        if !prefix.starts_with('/') {
            errors.push(ConfigError::InvalidField {
                field: format!("routes[{index}].prefix"),
                message: format!("Route prefix '{prefix}' must start with '/'"),
            });
        }

        if let Err(e) = Self::validate_url(target, &format!("routes[{index}].target")) {
            errors.push(e);
        }

        if route.timeout == Some(0) {
            errors.push(ConfigError::InvalidField {
                field: format!("routes[{index}].timeout"),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if !route.health_check.starts_with('/') {
            errors.push(ConfigError::InvalidField {
                field: format!("routes[{index}].healthCheck"),
                message: "Health check path must start with '/'".to_string(),
            });
        }

        if let Some(limit) = &route.rate_limit
            && let Err(e) = Self::validate_rate_limit(limit, &format!("routes[{index}].rateLimit"))
        {
            errors.push(e);
        }

        if let Some(rewrite) = &route.prefix_rewrite
            && !rewrite.is_empty()
            && !rewrite.starts_with('/')
        {
            errors.push(ConfigError::InvalidField {
                field: format!("routes[{index}].prefixRewrite"),
                message: "Prefix rewrite must be empty or start with '/'".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_rate_limit(limit: &RateLimitConfig, field: &str) -> ValidationResult<()> {
        if limit.window_ms == 0 || limit.max == 0 {
            return Err(ConfigError::InvalidField {
                field: field.to_string(),
                message: "windowMs and max must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Validate URL format
    fn validate_url(url: &str, field_name: &str) -> ValidationResult<()> {
        match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
            Ok(parsed) => Err(ConfigError::InvalidField {
                field: field_name.to_string(),
                message: format!("Unsupported scheme '{}', use http or https", parsed.scheme()),
            }),
            Err(e) => Err(ConfigError::InvalidField {
                field: field_name.to_string(),
                message: format!("Invalid URL '{url}': {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ConfigError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

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

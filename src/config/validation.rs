//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (default route exists)
//! - Validate value ranges and addresses
//! - Detect conflicting routes
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Pure function: RouterConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::{HandlerConfig, RouterConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("at least one route must be configured")]
    NoRoutes,
    #[error("route #{0} has an empty name")]
    EmptyRouteName(usize),
    #[error("route '{0}' has an empty prefix")]
    EmptyPrefix(String),
    #[error("route name '{0}' is used more than once")]
    DuplicateRouteName(String),
    #[error("prefix '{prefix}' of route '{route}' is already used")]
    DuplicatePrefix { route: String, prefix: String },
    #[error("default_route '{0}' does not name a configured route")]
    UnknownDefaultRoute(String),
    #[error("banner message of route '{0}' is empty")]
    EmptyBanner(String),
    #[error("{field} is not a valid socket address: '{value}'")]
    InvalidAddress { field: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &RouterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero("listener.max_connections"));
    }
    if config.listener.read_buffer_size == 0 {
        errors.push(ValidationError::Zero("listener.read_buffer_size"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if config.routes.is_empty() {
        errors.push(ValidationError::NoRoutes);
    }

    let mut names = HashSet::new();
    let mut prefixes = HashSet::new();
    for (index, route) in config.routes.iter().enumerate() {
        if route.name.is_empty() {
            errors.push(ValidationError::EmptyRouteName(index));
        } else if !names.insert(route.name.as_str()) {
            errors.push(ValidationError::DuplicateRouteName(route.name.clone()));
        }

        if route.prefix.is_empty() {
            errors.push(ValidationError::EmptyPrefix(route.name.clone()));
        } else if !prefixes.insert(route.prefix.as_str()) {
            errors.push(ValidationError::DuplicatePrefix {
                route: route.name.clone(),
                prefix: route.prefix.clone(),
            });
        }

        if let HandlerConfig::Banner { message } = &route.handler {
            if message.is_empty() {
                errors.push(ValidationError::EmptyBanner(route.name.clone()));
            }
        }
    }

    if let Some(default) = &config.routing.default_route {
        if !names.contains(default.as_str()) {
            errors.push(ValidationError::UnknownDefaultRoute(default.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

//! Compiled route table.
//!
//! # Design Decisions
//! - Built once from validated config, immutable afterwards
//! - Reloads build a new table and swap it in; pending connections keep
//!   the snapshot their parser was created with

use std::collections::HashMap;

use crate::config::{HandlerConfig, RouteConfig};

/// A single compiled route.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub name: String,
    pub prefix: Vec<u8>,
    pub handler: HandlerConfig,
}

/// Routes keyed by name, plus the prefixes the sniffer matches against.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Route>,
    /// Sorted longest prefix first.
    by_prefix: Vec<(Vec<u8>, String)>,
    default_route: Option<String>,
}

impl RouteTable {
    pub fn from_config(routes: &[RouteConfig], default_route: Option<String>) -> Self {
        let mut table = RouteTable {
            default_route,
            ..Default::default()
        };

        for config in routes {
            let route = Route {
                name: config.name.clone(),
                prefix: config.prefix.as_bytes().to_vec(),
                handler: config.handler.clone(),
            };
            table
                .by_prefix
                .push((route.prefix.clone(), route.name.clone()));
            table.routes.insert(route.name.clone(), route);
        }

        table
            .by_prefix
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        table
    }

    pub fn get(&self, name: &str) -> Option<&Route> {
        self.routes.get(name)
    }

    /// (prefix, route name) pairs, longest prefix first.
    pub fn prefixes(&self) -> &[(Vec<u8>, String)] {
        &self.by_prefix
    }

    pub fn default_route(&self) -> Option<&str> {
        self.default_route.as_deref()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

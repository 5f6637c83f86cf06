// ============================================================================
// Route Resolver
// ============================================================================
//
// An ordered table of compiled route patterns. Resolution walks the table in
// declaration order and returns the first entry whose pattern matches the
// request path AND whose method set contains the request method; an entry
// with a matching path but the wrong method simply does not match, so the
// caller sees ROUTE_NOT_FOUND rather than 405.
//
// Patterns are segment-wise prefixes with `:name` parameters, e.g.
// `/api/users/:id`. The matched prefix is what `stripPath` removes when
// building the upstream target.
//
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{Method, Uri};
use tokio::sync::RwLock;

use crate::config::{RouteDefinition, DEFAULT_ROUTE_RETRIES, DEFAULT_UPSTREAM_TIMEOUT_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    fn compile(raw: &str) -> Result<Self> {
        if !raw.starts_with('/') {
            anyhow::bail!("route pattern {:?} must start with '/'", raw);
        }
        let mut segments = Vec::new();
        for part in raw.split('/').filter(|s| !s.is_empty()) {
            if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    anyhow::bail!("route pattern {:?} has an unnamed parameter", raw);
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self { segments })
    }

    /// Match the pattern as a segment-wise prefix of `path`. On success
    /// returns the extracted parameters and the unmatched remainder
    /// (`""` for an exact match, `"/tail"` otherwise).
    fn match_prefix(&self, path: &str) -> Option<(HashMap<String, String>, String)> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() < self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts.iter()) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }

        let rest = &parts[self.segments.len()..];
        let remainder = if rest.is_empty() {
            String::new()
        } else {
            format!("/{}", rest.join("/"))
        };
        Some((params, remainder))
    }
}

/// A compiled route. Immutable once built; the table swaps whole entries on
/// admin changes.
#[derive(Debug)]
pub struct Route {
    pub path: String,
    pub target: String,
    pub methods: HashSet<Method>,
    pub timeout: Duration,
    pub retries: u32,
    pub auth_required: bool,
    pub rate_limit_tier: Option<String>,
    pub strip_path: bool,
    pub preserve_host: bool,
    pub required_roles: Vec<String>,
    pub required_permissions: Vec<String>,
    pattern: PathPattern,
    definition: RouteDefinition,
}

impl Route {
    pub fn from_definition(definition: RouteDefinition) -> Result<Self> {
        let pattern = PathPattern::compile(&definition.path)?;

        let mut methods = HashSet::new();
        for raw in &definition.methods {
            let method = Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("route {:?} has invalid method {:?}", definition.path, raw))?;
            methods.insert(method);
        }

        // preserveHost wins; changeOrigin is its inverse for configs that
        // still use the proxy-middleware vocabulary
        let preserve_host = definition
            .preserve_host
            .or(definition.change_origin.map(|c| !c))
            .unwrap_or(false);

        Ok(Route {
            path: definition.path.clone(),
            target: definition.target.trim_end_matches('/').to_string(),
            methods,
            timeout: Duration::from_millis(
                definition.timeout_ms.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS),
            ),
            retries: definition.retries.unwrap_or(DEFAULT_ROUTE_RETRIES),
            auth_required: definition.auth_required.unwrap_or(false),
            rate_limit_tier: definition.rate_limit_tier.clone(),
            strip_path: definition.strip_path.unwrap_or(false),
            preserve_host,
            required_roles: definition.required_roles.clone(),
            required_permissions: definition.required_permissions.clone(),
            pattern,
            definition,
        })
    }

    pub fn definition(&self) -> &RouteDefinition {
        &self.definition
    }

    /// Breaker key for the upstream this route targets: `host:port`.
    pub fn service_key(&self) -> String {
        match self.target.parse::<Uri>() {
            Ok(uri) => {
                let host = uri.host().unwrap_or("unknown").to_string();
                let port = uri.port_u16().unwrap_or_else(|| {
                    if uri.scheme_str() == Some("https") {
                        443
                    } else {
                        80
                    }
                });
                format!("{}:{}", host, port)
            }
            Err(_) => self.target.clone(),
        }
    }

    /// Build the upstream target URL for a matched request.
    pub fn target_url(&self, path: &str, query: Option<&str>, matched_rest: &str) -> String {
        let forward_path = if self.strip_path {
            if matched_rest.is_empty() {
                "/"
            } else {
                matched_rest
            }
        } else {
            path
        };

        match query {
            Some(q) => format!("{}{}?{}", self.target, forward_path, q),
            None => format!("{}{}", self.target, forward_path),
        }
    }
}

/// Successful resolution: the route plus extracted path parameters and the
/// post-prefix remainder used for target building.
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: HashMap<String, String>,
    pub rest: String,
}

/// Read-mostly route table. Admin add/remove take the write lock; resolution
/// only ever reads.
pub struct RouteTable {
    routes: RwLock<Vec<Arc<Route>>>,
}

impl RouteTable {
    pub fn new(definitions: Vec<RouteDefinition>) -> Result<Self> {
        let mut routes = Vec::with_capacity(definitions.len());
        for definition in definitions {
            routes.push(Arc::new(Route::from_definition(definition)?));
        }
        Ok(Self {
            routes: RwLock::new(routes),
        })
    }

    /// First entry, in declaration order, whose pattern matches the path and
    /// whose method set contains the method.
    pub async fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let routes = self.routes.read().await;
        for route in routes.iter() {
            if !route.methods.contains(method) {
                continue;
            }
            if let Some((params, rest)) = route.pattern.match_prefix(path) {
                return Some(RouteMatch {
                    route: route.clone(),
                    params,
                    rest,
                });
            }
        }
        None
    }

    pub async fn add(&self, definition: RouteDefinition) -> Result<()> {
        let route = Arc::new(Route::from_definition(definition)?);
        self.routes.write().await.push(route);
        Ok(())
    }

    /// Remove every entry declared with `path`. Returns how many went.
    pub async fn remove(&self, path: &str) -> usize {
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|route| route.path != path);
        before - routes.len()
    }

    pub async fn definitions(&self) -> Vec<RouteDefinition> {
        self.routes
            .read()
            .await
            .iter()
            .map(|route| route.definition().clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }
}

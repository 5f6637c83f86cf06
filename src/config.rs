// ============================================================================
// Gateway Configuration
// ============================================================================
//
// All runtime configuration comes from the environment, with sane defaults
// for development. Routes are declared as a JSON array either inline
// (GATEWAY_ROUTES) or in a file (GATEWAY_ROUTES_FILE); the same shape is
// accepted by the admin route endpoints.
//
// ============================================================================

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// Defaults
// ============================================================================

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_JWT_EXPIRY_SECS: i64 = 3600;
const DEFAULT_REDIS_PORT: u16 = 6379;

pub const DEFAULT_RATE_LIMIT_REQUESTS: i64 = 100;
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: i64 = 60_000;

pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_RECOVERY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BREAKER_MONITOR_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ROUTE_RETRIES: u32 = 3;

const DEFAULT_SHUTDOWN_DRAIN_SECS: u64 = 5;

// Admission limits
pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_HEADER_COUNT: usize = 100;
pub const MAX_HEADER_NAME_BYTES: usize = 256;
pub const MAX_HEADER_VALUE_BYTES: usize = 4096;
pub const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Name of the default tier a route falls back to.
pub const DEFAULT_TIER: &str = "basic";

// ============================================================================
// Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub expiry_secs: i64,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}", password, self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

/// Requests allowed per window for one tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierConfig {
    pub requests: i64,
    #[serde(rename = "windowMs", alias = "window_ms")]
    pub window_ms: i64,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub default_requests: i64,
    pub default_window_ms: i64,
    pub tiers: HashMap<String, TierConfig>,
}

impl RateLimitSettings {
    /// Tier lookup with fallback to the configured default limits.
    pub fn tier(&self, name: &str) -> TierConfig {
        self.tiers.get(name).copied().unwrap_or(TierConfig {
            requests: self.default_requests,
            window_ms: self.default_window_ms,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    /// Interval for the background state-observation loop.
    pub monitor_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

/// One route as declared in configuration or through the admin surface.
///
/// `changeOrigin` is accepted for compatibility with proxy configs that use
/// it; it is the inverse of `preserveHost` and only consulted when
/// `preserveHost` is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub path: String,
    pub target: String,
    #[serde(default, rename = "timeoutMs", alias = "timeout_ms")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default, rename = "authRequired", alias = "auth_required")]
    pub auth_required: Option<bool>,
    #[serde(default, rename = "rateLimitTier", alias = "rate_limit_tier")]
    pub rate_limit_tier: Option<String>,
    pub methods: Vec<String>,
    #[serde(default, rename = "stripPath", alias = "strip_path")]
    pub strip_path: Option<bool>,
    #[serde(default, rename = "preserveHost", alias = "preserve_host")]
    pub preserve_host: Option<bool>,
    #[serde(default, rename = "changeOrigin", alias = "change_origin")]
    pub change_origin: Option<bool>,
    #[serde(default, rename = "requiredRoles", alias = "required_roles")]
    pub required_roles: Vec<String>,
    #[serde(
        default,
        rename = "requiredPermissions",
        alias = "required_permissions"
    )]
    pub required_permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: Environment,
    pub jwt: JwtConfig,
    pub redis: RedisConfig,
    pub rate_limit: RateLimitSettings,
    pub breaker: BreakerSettings,
    pub logging: LoggingConfig,
    pub routes: Vec<RouteDefinition>,
    pub shutdown_drain_secs: u64,
}

// ============================================================================
// Loading
// ============================================================================

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let environment = match env_or("GATEWAY_ENV", "development").as_str() {
            "production" => Environment::Production,
            _ => Environment::Development,
        };

        let secret = env::var("JWT_SECRET").unwrap_or_default();
        if secret.is_empty() && environment.is_production() {
            anyhow::bail!("JWT_SECRET is required in production");
        }
        let jwt = JwtConfig {
            secret: if secret.is_empty() {
                // development fallback so a bare `cargo run` works
                "dev-secret-change-me".to_string()
            } else {
                secret
            },
            expiry_secs: env_parse("JWT_EXPIRY_SECS", DEFAULT_JWT_EXPIRY_SECS)?,
        };

        let redis = RedisConfig {
            host: env_or("REDIS_HOST", "127.0.0.1"),
            port: env_parse("REDIS_PORT", DEFAULT_REDIS_PORT)?,
            password: env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
        };

        let rate_limit = RateLimitSettings {
            default_requests: env_parse("RATE_LIMIT_DEFAULT_REQUESTS", DEFAULT_RATE_LIMIT_REQUESTS)?,
            default_window_ms: env_parse(
                "RATE_LIMIT_DEFAULT_WINDOW_MS",
                DEFAULT_RATE_LIMIT_WINDOW_MS,
            )?,
            tiers: load_tiers()?,
        };

        let breaker = BreakerSettings {
            failure_threshold: env_parse(
                "BREAKER_FAILURE_THRESHOLD",
                DEFAULT_BREAKER_FAILURE_THRESHOLD,
            )?,
            recovery_timeout_secs: env_parse(
                "BREAKER_RECOVERY_TIMEOUT_SECS",
                DEFAULT_BREAKER_RECOVERY_TIMEOUT_SECS,
            )?,
            monitor_timeout_secs: env_parse(
                "BREAKER_MONITOR_TIMEOUT_SECS",
                DEFAULT_BREAKER_MONITOR_TIMEOUT_SECS,
            )?,
        };

        let logging = LoggingConfig {
            level: env_or("LOG_LEVEL", "info"),
            file: env::var("LOG_FILE").ok().map(PathBuf::from),
        };

        let config = Config {
            port: env_parse("GATEWAY_PORT", DEFAULT_PORT)?,
            environment,
            jwt,
            redis,
            rate_limit,
            breaker,
            logging,
            routes: load_routes()?,
            shutdown_drain_secs: env_parse("SHUTDOWN_DRAIN_SECS", DEFAULT_SHUTDOWN_DRAIN_SECS)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup validation; also reused by the deep health probe.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.default_requests <= 0 {
            anyhow::bail!("rate-limit default request count must be positive");
        }
        if self.rate_limit.default_window_ms <= 0 {
            anyhow::bail!("rate-limit default window must be positive");
        }
        for (name, tier) in &self.rate_limit.tiers {
            if tier.requests <= 0 || tier.window_ms <= 0 {
                anyhow::bail!("tier {:?} has a non-positive limit or window", name);
            }
        }
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker failure threshold must be at least 1");
        }
        for route in &self.routes {
            if route.methods.is_empty() {
                anyhow::bail!("route {:?} declares no methods", route.path);
            }
            if !route.target.starts_with("http://") && !route.target.starts_with("https://") {
                anyhow::bail!("route {:?} target must be an absolute http(s) URL", route.path);
            }
        }
        Ok(())
    }
}

impl Default for Config {
    /// Development defaults, used by tests and `cargo run` without env.
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            environment: Environment::Development,
            jwt: JwtConfig {
                secret: "dev-secret-change-me".to_string(),
                expiry_secs: DEFAULT_JWT_EXPIRY_SECS,
            },
            redis: RedisConfig {
                host: "127.0.0.1".to_string(),
                port: DEFAULT_REDIS_PORT,
                password: None,
            },
            rate_limit: RateLimitSettings {
                default_requests: DEFAULT_RATE_LIMIT_REQUESTS,
                default_window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
                tiers: builtin_tiers(),
            },
            breaker: BreakerSettings {
                failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
                recovery_timeout_secs: DEFAULT_BREAKER_RECOVERY_TIMEOUT_SECS,
                monitor_timeout_secs: DEFAULT_BREAKER_MONITOR_TIMEOUT_SECS,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
            },
            routes: Vec::new(),
            shutdown_drain_secs: DEFAULT_SHUTDOWN_DRAIN_SECS,
        }
    }
}

/// Built-in tier table, overridable via RATE_LIMIT_TIERS.
fn builtin_tiers() -> HashMap<String, TierConfig> {
    HashMap::from([
        (
            "basic".to_string(),
            TierConfig {
                requests: 100,
                window_ms: 60_000,
            },
        ),
        (
            "premium".to_string(),
            TierConfig {
                requests: 1_000,
                window_ms: 60_000,
            },
        ),
        (
            "enterprise".to_string(),
            TierConfig {
                requests: 10_000,
                window_ms: 60_000,
            },
        ),
    ])
}

fn load_tiers() -> Result<HashMap<String, TierConfig>> {
    let mut tiers = builtin_tiers();
    if let Ok(raw) = env::var("RATE_LIMIT_TIERS") {
        let overrides: HashMap<String, TierConfig> =
            serde_json::from_str(&raw).context("RATE_LIMIT_TIERS is not a valid JSON tier map")?;
        tiers.extend(overrides);
    }
    Ok(tiers)
}

fn load_routes() -> Result<Vec<RouteDefinition>> {
    if let Ok(raw) = env::var("GATEWAY_ROUTES") {
        return serde_json::from_str(&raw).context("GATEWAY_ROUTES is not a valid JSON route list");
    }
    if let Ok(path) = env::var("GATEWAY_ROUTES_FILE") {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read routes file {:?}", path))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("routes file {:?} is not a valid JSON route list", path));
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_lookup_falls_back_to_defaults() {
        let config = Config::default();
        let tier = config.rate_limit.tier("no-such-tier");
        assert_eq!(tier.requests, DEFAULT_RATE_LIMIT_REQUESTS);
        assert_eq!(tier.window_ms, DEFAULT_RATE_LIMIT_WINDOW_MS);

        let basic = config.rate_limit.tier("basic");
        assert_eq!(basic.requests, 100);
    }

    #[test]
    fn route_definition_accepts_camel_and_snake_case() {
        let camel: RouteDefinition = serde_json::from_str(
            r#"{"path": "/api/users", "target": "http://users:3001",
                "methods": ["GET"], "stripPath": true, "authRequired": true}"#,
        )
        .unwrap();
        assert_eq!(camel.strip_path, Some(true));
        assert_eq!(camel.auth_required, Some(true));

        let snake: RouteDefinition = serde_json::from_str(
            r#"{"path": "/api/users", "target": "http://users:3001",
                "methods": ["GET"], "strip_path": false, "rate_limit_tier": "premium"}"#,
        )
        .unwrap();
        assert_eq!(snake.strip_path, Some(false));
        assert_eq!(snake.rate_limit_tier.as_deref(), Some("premium"));
    }

    #[test]
    fn validation_rejects_bad_routes() {
        let mut config = Config::default();
        config.routes.push(RouteDefinition {
            path: "/api/x".into(),
            target: "users:3001".into(),
            timeout_ms: None,
            retries: None,
            auth_required: None,
            rate_limit_tier: None,
            methods: vec!["GET".into()],
            strip_path: None,
            preserve_host: None,
            change_origin: None,
            required_roles: vec![],
            required_permissions: vec![],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn redis_url_includes_password_when_set() {
        let mut redis = RedisConfig {
            host: "cache".into(),
            port: 6380,
            password: None,
        };
        assert_eq!(redis.url(), "redis://cache:6380");
        redis.password = Some("hunter2".into());
        assert_eq!(redis.url(), "redis://:hunter2@cache:6380");
    }
}

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::authz::hierarchy::DescendantStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub authz: AuthzConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection
    pub connection_timeout: u64,
    /// Role assumed on every new connection (`SET ROLE`); `None` keeps the login role
    pub app_role: Option<String>,
    /// Per unit of work `statement_timeout`, 0 disables
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthzConfig {
    pub max_hierarchy_depth: usize,
    pub unit_of_work_timeout_ms: u64,
    /// System administrators may request `Direction::Global` only when set
    pub allow_global_scope: bool,
    /// Re-run the privilege guard on this interval; `None` runs it at startup only
    pub guard_interval_secs: Option<u64>,
    pub descendant_strategy: DescendantStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
    #[serde(skip_serializing, default)]
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
}

impl AuthzConfig {
    pub fn unit_of_work_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_of_work_timeout_ms)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        // Database overrides
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout = v.parse().unwrap_or(self.database.connection_timeout);
        }
        if let Ok(v) = env::var("DATABASE_APP_ROLE") {
            let v = v.trim();
            self.database.app_role = (!v.is_empty()).then(|| v.to_string());
        }
        if let Ok(v) = env::var("DATABASE_STATEMENT_TIMEOUT_MS") {
            self.database.statement_timeout_ms = v.parse().unwrap_or(self.database.statement_timeout_ms);
        }

        // Authorization overrides
        if let Ok(v) = env::var("AUTHZ_MAX_HIERARCHY_DEPTH") {
            self.authz.max_hierarchy_depth = v.parse().unwrap_or(self.authz.max_hierarchy_depth);
        }
        if let Ok(v) = env::var("AUTHZ_UNIT_OF_WORK_TIMEOUT_MS") {
            self.authz.unit_of_work_timeout_ms = v.parse().unwrap_or(self.authz.unit_of_work_timeout_ms);
        }
        if let Ok(v) = env::var("AUTHZ_ALLOW_GLOBAL_SCOPE") {
            self.authz.allow_global_scope = v.parse().unwrap_or(self.authz.allow_global_scope);
        }
        if let Ok(v) = env::var("AUTHZ_GUARD_INTERVAL_SECS") {
            self.authz.guard_interval_secs = v.parse().ok().filter(|secs| *secs > 0);
        }
        if let Ok(v) = env::var("AUTHZ_DESCENDANT_STRATEGY") {
            self.authz.descendant_strategy = v.parse().unwrap_or(self.authz.descendant_strategy);
        }

        // Security overrides
        if let Ok(v) = env::var("SECURITY_ENABLE_CORS") {
            self.security.enable_cors = v.parse().unwrap_or(self.security.enable_cors);
        }
        if let Ok(v) = env::var("SECURITY_CORS_ORIGINS") {
            self.security.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("JWT_SECRET") {
            self.security.jwt_secret = v;
        }
        if let Ok(v) = env::var("SECURITY_JWT_EXPIRY_HOURS") {
            self.security.jwt_expiry_hours = v.parse().unwrap_or(self.security.jwt_expiry_hours);
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            database: DatabaseConfig {
                max_connections: 10,
                connection_timeout: 30,
                app_role: None,
                statement_timeout_ms: 0,
            },
            authz: AuthzConfig {
                max_hierarchy_depth: 32,
                unit_of_work_timeout_ms: 30_000,
                allow_global_scope: false,
                guard_interval_secs: None,
                descendant_strategy: DescendantStrategy::MaterializedPath,
            },
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["http://localhost:3000".to_string(), "http://localhost:5173".to_string()],
                jwt_secret: String::new(),
                jwt_expiry_hours: 24 * 7, // 1 week
            },
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            database: DatabaseConfig {
                max_connections: 20,
                connection_timeout: 10,
                app_role: Some("orgscope_app".to_string()),
                statement_timeout_ms: 15_000,
            },
            authz: AuthzConfig {
                max_hierarchy_depth: 32,
                unit_of_work_timeout_ms: 30_000,
                allow_global_scope: false,
                guard_interval_secs: Some(300),
                descendant_strategy: DescendantStrategy::MaterializedPath,
            },
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["https://staging.example.com".to_string()],
                jwt_secret: String::new(),
                jwt_expiry_hours: 24,
            },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            database: DatabaseConfig {
                max_connections: 50,
                connection_timeout: 5,
                app_role: Some("orgscope_app".to_string()),
                statement_timeout_ms: 10_000,
            },
            authz: AuthzConfig {
                max_hierarchy_depth: 32,
                unit_of_work_timeout_ms: 30_000,
                allow_global_scope: false,
                guard_interval_secs: Some(60),
                descendant_strategy: DescendantStrategy::MaterializedPath,
            },
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["https://app.example.com".to_string()],
                jwt_secret: String::new(),
                jwt_expiry_hours: 4,
            },
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

// Helper macros for common checks
#[macro_export]
macro_rules! is_development {
    () => {
        matches!($crate::config::CONFIG.environment, $crate::config::Environment::Development)
    };
}

#[macro_export]
macro_rules! is_production {
    () => {
        matches!($crate::config::CONFIG.environment, $crate::config::Environment::Production)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_development_config() {
        let config = AppConfig::development();
        assert_eq!(config.authz.max_hierarchy_depth, 32);
        assert_eq!(config.authz.unit_of_work_timeout(), Duration::from_secs(30));
        assert!(!config.authz.allow_global_scope);
        assert!(config.database.app_role.is_none());
    }

    #[test]
    fn test_default_production_config() {
        let config = AppConfig::production();
        assert_eq!(config.environment, Environment::Production);
        assert!(!config.authz.allow_global_scope);
        assert_eq!(config.database.app_role.as_deref(), Some("orgscope_app"));
        assert!(config.authz.guard_interval_secs.is_some());
    }

    #[test]
    fn secret_is_never_serialized() {
        let mut config = AppConfig::development();
        config.security.jwt_secret = "hunter2".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }
}

// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Individual modules (DB pool, CORS) may still read their
// own env vars — this module covers the core server settings.

use std::net::SocketAddr;
use std::time::Duration;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Signing secret for capability tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `formsync_relay=debug`).
    pub log_filter: String,
    /// Debounce window before buffered edits are flushed.
    pub autosave_debounce: Duration,
    /// Connection cap for the shared Postgres pool.
    pub db_max_connections: u32,
    /// How long to wait for a pooled connection before failing.
    pub db_acquire_timeout: Duration,
}

const DEFAULT_AUTOSAVE_MS: u64 = 5_000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FORMSYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `FORMSYNC_RELAY_PORT` | `8080` |
    /// | `FORMSYNC_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `FORMSYNC_RELAY_DATABASE_URL` | *(none — in-memory stores)* |
    /// | `FORMSYNC_RELAY_CORS_ORIGINS` | *(none — cors.rs uses dev defaults)* |
    /// | `FORMSYNC_RELAY_LOG_FILTER` | `info` |
    /// | `FORMSYNC_RELAY_AUTOSAVE_MS` | `5000` |
    /// | `FORMSYNC_RELAY_DB_MAX_CONNECTIONS` | `20` |
    /// | `FORMSYNC_RELAY_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("FORMSYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("FORMSYNC_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("FORMSYNC_RELAY_JWT_SECRET").unwrap_or_else(|_| {
            "formsync_local_development_jwt_secret_must_be_32_chars".into()
        });

        let database_url = env("FORMSYNC_RELAY_DATABASE_URL").ok();
        let cors_origins = env("FORMSYNC_RELAY_CORS_ORIGINS").ok();

        let log_filter =
            env("FORMSYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let autosave_ms = env("FORMSYNC_RELAY_AUTOSAVE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_AUTOSAVE_MS);

        let db_max_connections = env("FORMSYNC_RELAY_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
        let db_acquire_timeout_secs = env("FORMSYNC_RELAY_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS);

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            cors_origins,
            log_filter,
            autosave_debounce: Duration::from_millis(autosave_ms),
            db_max_connections,
            db_acquire_timeout: Duration::from_secs(db_acquire_timeout_secs),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == "formsync_local_development_jwt_secret_must_be_32_chars"
    }
}

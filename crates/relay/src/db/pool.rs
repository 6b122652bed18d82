// Postgres connectivity for the relay stores.
//
// One pool is shared by the document store, the search mirror, and the
// pending-update store. Plaintext connections are refused: every
// deployment target sits behind TLS-terminating managed Postgres, and
// a connection string without sslmode=require (or stricter) is a
// misconfiguration, not a preference.

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

use crate::config::RelayConfig;

pub async fn connect(database_url: &str, config: &RelayConfig) -> Result<PgPool> {
    let options = database_url
        .parse::<PgConnectOptions>()
        .context("failed to parse FORMSYNC_RELAY_DATABASE_URL")?;
    require_tls(&options)?;

    PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.db_acquire_timeout)
        .connect_with(options)
        .await
        .context("failed to connect to postgres")
}

fn require_tls(options: &PgConnectOptions) -> Result<()> {
    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!(
            "database connection must use TLS (sslmode=require or stricter), got sslmode={mode:?}"
        ),
    }
}

pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("postgres ping failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{require_tls, PgConnectOptions};

    fn options(url: &str) -> PgConnectOptions {
        url.parse().expect("connection url should parse")
    }

    #[test]
    fn tls_modes_are_accepted() {
        for mode in ["require", "verify-ca", "verify-full"] {
            let url = format!("postgres://relay:pw@db.internal/formsync?sslmode={mode}");
            require_tls(&options(&url)).expect("TLS mode should be accepted");
        }
    }

    #[test]
    fn plaintext_modes_are_refused() {
        for mode in ["disable", "prefer", "allow"] {
            let url = format!("postgres://relay:pw@db.internal/formsync?sslmode={mode}");
            let error = require_tls(&options(&url)).expect_err("plaintext should be refused");
            assert!(error.to_string().contains("must use TLS"));
        }
    }
}

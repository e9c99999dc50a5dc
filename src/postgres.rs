// ABOUTME: PostgreSQL connection helpers for the local store
// ABOUTME: Native TLS, self-signed certificate policy and connect retries

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set once at startup from `--allow-self-signed-certs`.
pub fn init_tls_policy(allow_self_signed: bool) {
    let _ = ALLOW_SELF_SIGNED.set(allow_self_signed);
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

/// Open a connection and drive it on a background task.
pub async fn connect(url: &str) -> Result<Client> {
    let mut builder = TlsConnector::builder();
    if allow_self_signed() {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    let connector = builder.build().context("Failed to build TLS connector")?;
    let connector = MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, connector)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to {}",
                crate::utils::mask_url_password(url)
            )
        })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with three retries and exponential backoff starting at one second.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    crate::utils::retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}

#![allow(dead_code)]

use std::{future::Future, time::Duration};

use anyhow::{Context, Result};

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Awaits `future`, failing the test if it takes longer than a second.
pub async fn within<T>(future: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(Duration::from_secs(1), future)
        .await
        .context("timed out")
}

/// Polls `condition` until it holds, yielding to other tasks in between.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> Result<()> {
    within(async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
}

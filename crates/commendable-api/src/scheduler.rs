//! Background recomputation of materialized recommendations.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::CommendableApi;

const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Background loop keeping materialized recommendations current.
///
/// Each step waits for the ingestion backlog to drain, pops the oldest queued
/// change and recomputes that user's recommended range. Changes are not
/// coalesced: a user with N queued likes is recomputed N times.
#[derive(Clone)]
pub struct RefreshScheduler {
    api: CommendableApi,
}

impl RefreshScheduler {
    #[must_use]
    pub fn new(api: CommendableApi) -> Self {
        Self { api }
    }

    /// Run one refresh. Returns the refreshed user, or `None` when the change
    /// queue was empty.
    ///
    /// # Errors
    /// Returns an error when the change queue or the recomputation fails.
    pub async fn step(&self) -> Result<Option<String>> {
        self.api.backlog().wait_idle().await;
        let api = self.api.clone();
        tokio::task::spawn_blocking(move || {
            let Some(user) = api.pop_change()? else {
                return Ok(None);
            };
            let written = api.refresh(&user)?;
            tracing::debug!(user = %user, written, "refreshed recommendations");
            Ok(Some(user))
        })
        .await
        .context("refresh task panicked")?
    }

    /// Step forever, sleeping on the change signal while the queue is empty.
    pub async fn run(self) {
        loop {
            let notified = self.api.changes_notified();
            match self.step().await {
                Ok(Some(_)) => {}
                Ok(None) => notified.await,
                Err(err) => {
                    tracing::error!(error = format!("{err:#}"), "background refresh failed");
                    tokio::time::sleep(FAILURE_BACKOFF).await;
                }
            }
        }
    }
}

//! Parallel range loading with per-chunk retry.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::source::{EventFilter, EventSource, RawEvent};
use crate::error::SyncError;

/// Issues run tokens; starting a new run invalidates every earlier token.
#[derive(Debug, Default)]
pub struct RunControl {
    current: Arc<AtomicU64>,
    issued: AtomicU64,
}

impl RunControl {
    /// Create a controller with no active run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new run.
    pub fn issue(&self) -> RunToken {
        let id = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.current.store(id, Ordering::SeqCst);
        RunToken {
            current: Some(self.current.clone()),
            id,
        }
    }

    /// Invalidate the active run.
    pub fn stop(&self) {
        self.current.store(0, Ordering::SeqCst);
    }

    /// Whether some run is active.
    pub fn is_running(&self) -> bool {
        self.current.load(Ordering::SeqCst) != 0
    }
}

/// Cooperative cancellation handle, checked at iteration boundaries.
#[derive(Debug, Clone)]
pub struct RunToken {
    current: Option<Arc<AtomicU64>>,
    id: u64,
}

impl RunToken {
    /// A token no run controller can cancel.
    pub fn detached() -> Self {
        Self {
            current: None,
            id: 0,
        }
    }

    /// Whether the run that issued this token is still the active one.
    pub fn is_live(&self) -> bool {
        match &self.current {
            Some(current) => current.load(Ordering::SeqCst) == self.id,
            None => true,
        }
    }
}

/// Fetches a block range as concurrent sub-ranges.
///
/// Returns only once every sub-range succeeded; failed sub-ranges are
/// retried with doubling backoff until they succeed or the run is cancelled.
#[derive(Clone)]
pub struct EventLoader {
    source: Arc<dyn EventSource>,
    filter: EventFilter,
    block_rate: u64,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl EventLoader {
    /// Create a loader.
    pub fn new(
        source: Arc<dyn EventSource>,
        filter: EventFilter,
        block_rate: u64,
        min_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            source,
            filter,
            block_rate: block_rate.max(1),
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
        }
    }

    /// Same loader with a different filter.
    pub fn with_filter(&self, filter: EventFilter) -> Self {
        Self {
            filter,
            ..self.clone()
        }
    }

    /// Sub-ranges covering `from..=to`.
    pub fn chunks(&self, from: u64, to: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(self.block_rate - 1).min(to);
            out.push((start, end));
            match end.checked_add(1) {
                Some(next) => start = next,
                None => break,
            }
        }
        out
    }

    /// Load every matching event in `from..=to`, unordered.
    pub async fn load(&self, from: u64, to: u64, token: &RunToken) -> Result<Vec<RawEvent>> {
        let chunks = self.chunks(from, to);
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            "Loading blocks {} to {} in {} chunks",
            from,
            to,
            chunks.len()
        );

        let mut set = JoinSet::new();
        for (start, end) in chunks {
            let loader = self.clone();
            let token = token.clone();
            set.spawn(async move { loader.load_chunk(start, end, &token).await });
        }

        let mut events = Vec::new();
        while let Some(joined) = set.join_next().await {
            let chunk = joined.context("Event loader task panicked")??;
            events.extend(chunk);
        }

        Ok(events)
    }

    async fn load_chunk(&self, from: u64, to: u64, token: &RunToken) -> Result<Vec<RawEvent>> {
        let mut backoff = self.min_backoff;
        loop {
            if !token.is_live() {
                return Err(SyncError::Cancelled.into());
            }
            match self.source.query_filter(&self.filter, from, to).await {
                Ok(events) => return Ok(events),
                Err(e) => {
                    warn!(
                        "Unable to load events for blocks {} to {}, retrying in {:?}: {:#}",
                        from, to, backoff, e
                    );
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }
}

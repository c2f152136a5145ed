//! Tablet-server admin RPCs and the shared retry wrapper.
//!
//! The controller is transport-agnostic: tablet servers sit behind the
//! [`TabletServerRpc`] trait, and every call goes through [`RpcRetrier`],
//! which owns attempt deadlines, capped backoff, fatal-code classification,
//! and clock propagation.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use crate::catalog::{IndexInfo, SchemaVersion, TabletId, TserverUuid};
use crate::clock::{HybridClock, HybridTime};
use crate::config::BackfillConfig;
use crate::error::TabletServerError;

/// Backoff floor for the first retry.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Cap on the exponential backoff shift.
const RETRY_BACKOFF_MAX_SHIFT: u32 = 6;

#[derive(Clone, Debug)]
pub struct GetSafeTimeRequest {
    pub dest_uuid: TserverUuid,
    pub tablet_id: TabletId,
    /// Floor for the safe time the tablet may report.
    pub min_hybrid_time_for_backfill: HybridTime,
    pub propagated_hybrid_time: HybridTime,
}

#[derive(Clone, Copy, Debug)]
pub struct GetSafeTimeResponse {
    pub safe_time: HybridTime,
    pub propagated_hybrid_time: HybridTime,
}

#[derive(Clone, Debug)]
pub struct BackfillChunkRequest {
    pub dest_uuid: TserverUuid,
    pub tablet_id: TabletId,
    /// Snapshot read point elected for this backfill.
    pub read_at_hybrid_time: HybridTime,
    pub schema_version: SchemaVersion,
    /// First row key of the chunk; empty = start of tablet.
    pub start_key: Vec<u8>,
    pub indexes: Vec<IndexInfo>,
    pub propagated_hybrid_time: HybridTime,
}

#[derive(Clone, Debug)]
pub struct BackfillChunkResponse {
    /// Resume key for the next chunk; empty = reached the end of the tablet.
    pub backfilled_until: Vec<u8>,
    pub propagated_hybrid_time: HybridTime,
}

#[derive(Clone, Debug)]
pub struct BackfillDoneRequest {
    pub dest_uuid: TserverUuid,
    pub tablet_id: TabletId,
    pub propagated_hybrid_time: HybridTime,
}

#[derive(Clone, Copy, Debug)]
pub struct BackfillDoneResponse {
    pub propagated_hybrid_time: HybridTime,
}

/// Responses that carry the serving peer's clock reading.
pub trait CarriesClock {
    fn propagated_hybrid_time(&self) -> Option<HybridTime>;
}

impl CarriesClock for GetSafeTimeResponse {
    fn propagated_hybrid_time(&self) -> Option<HybridTime> {
        Some(self.propagated_hybrid_time)
    }
}

impl CarriesClock for BackfillChunkResponse {
    fn propagated_hybrid_time(&self) -> Option<HybridTime> {
        Some(self.propagated_hybrid_time)
    }
}

impl CarriesClock for BackfillDoneResponse {
    fn propagated_hybrid_time(&self) -> Option<HybridTime> {
        Some(self.propagated_hybrid_time)
    }
}

/// Admin RPC surface of a tablet server, addressed by the `dest_uuid` carried
/// in each request.
#[async_trait]
pub trait TabletServerRpc: Send + Sync + 'static {
    async fn get_safe_time(
        &self,
        req: GetSafeTimeRequest,
    ) -> Result<GetSafeTimeResponse, TabletServerError>;

    async fn backfill_chunk(
        &self,
        req: BackfillChunkRequest,
    ) -> Result<BackfillChunkResponse, TabletServerError>;

    async fn backfill_done(
        &self,
        req: BackfillDoneRequest,
    ) -> Result<BackfillDoneResponse, TabletServerError>;
}

/// Retry policy shared by every backfill RPC.
pub struct RpcRetrier<'a> {
    config: &'a BackfillConfig,
    clock: &'a HybridClock,
    /// Overall deadline; per-attempt deadlines never extend past it.
    deadline: Option<Instant>,
}

impl<'a> RpcRetrier<'a> {
    pub fn new(config: &'a BackfillConfig, clock: &'a HybridClock) -> Self {
        Self {
            config,
            clock,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Run `send` until it succeeds, returns a fatal code, exhausts the
    /// attempt cap, or passes the overall deadline. Every response,
    /// including failures, folds the peer's clock reading into the master
    /// clock.
    pub async fn run<T, F, Fut>(&self, what: &str, mut send: F) -> anyhow::Result<T>
    where
        T: CarriesClock,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TabletServerError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let per_attempt = self.per_attempt_timeout()?;
            let err = match tokio::time::timeout(per_attempt, send()).await {
                Ok(Ok(response)) => {
                    if let Some(ht) = response.propagated_hybrid_time() {
                        self.clock.observe(ht);
                    }
                    return Ok(response);
                }
                Ok(Err(err)) => {
                    if let Some(ht) = err.propagated_hybrid_time {
                        self.clock.observe(ht);
                    }
                    err
                }
                Err(_) => TabletServerError::timed_out(what),
            };

            if err.code.is_fatal() {
                tracing::warn!(rpc = what, code = ?err.code, error = %err, "fatal tablet server error, not retrying");
                return Err(anyhow::Error::new(err).context(format!("{what} failed fatally")));
            }
            if attempt >= self.config.rpc_max_retries.max(1) {
                tracing::warn!(rpc = what, attempts = attempt, error = %err, "retries exhausted");
                return Err(anyhow::Error::new(err)
                    .context(format!("{what} failed after {attempt} attempts")));
            }

            let delay = retry_delay(attempt, self.config.rpc_max_delay);
            tracing::debug!(
                rpc = what,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "tablet rpc failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn per_attempt_timeout(&self) -> anyhow::Result<Duration> {
        let mut timeout = self.config.rpc_timeout;
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("rpc deadline exceeded");
            }
            timeout = timeout.min(remaining);
        }
        Ok(timeout)
    }
}

/// Exponential backoff with jitter, capped at `max_delay`.
fn retry_delay(attempt: u32, max_delay: Duration) -> Duration {
    let shift = attempt.min(RETRY_BACKOFF_MAX_SHIFT);
    let ceiling = RETRY_BACKOFF_BASE
        .saturating_mul(1 << shift)
        .min(max_delay.max(Duration::from_millis(1)));
    let ceiling_ms = ceiling.as_millis().max(1) as u64;
    let jittered = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
    Duration::from_millis(jittered)
}

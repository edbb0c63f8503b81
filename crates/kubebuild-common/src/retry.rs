//! Jittered delays and cancellation-aware waiting.
//!
//! Every polling loop in kubebuild sleeps between cluster API calls. Those
//! sleeps, and the calls themselves, are raced against the caller's
//! [`CancellationToken`] so a cancelled invocation stops promptly instead of
//! running out its wait budget.

use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Granularity of bootstrap race jitter
pub const JITTER_STEP: Duration = Duration::from_millis(25);

/// Largest multiple of [`JITTER_STEP`] a jittered delay may use (25ms - 1000ms)
pub const JITTER_MAX_STEPS: u32 = 40;

/// Source of randomized retry delays.
///
/// Injected rather than global so tests can supply a deterministic sequence.
pub trait Jitter: Send {
    /// Produce the next delay to wait before retrying
    fn next_delay(&mut self) -> Duration;
}

/// Uniform jitter between 25ms and 1000ms in 25ms steps.
pub struct RandomJitter {
    rng: StdRng,
}

impl RandomJitter {
    /// Seed from OS entropy. Intended to be created once per process.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seed from a fixed value
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Jitter for RandomJitter {
    fn next_delay(&mut self) -> Duration {
        JITTER_STEP * self.rng.gen_range(1..=JITTER_MAX_STEPS)
    }
}

/// Sleep for `delay`, returning early with [`Error::Cancelled`] if `token` fires.
pub async fn sleep_or_cancel(
    token: &CancellationToken,
    delay: Duration,
    context: &str,
) -> Result<(), Error> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::cancelled(context)),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Drive `fut` to completion unless `token` is cancelled first.
///
/// Cancellation wins ties so an already-cancelled token never issues the call.
pub async fn cancellable<T, F>(token: &CancellationToken, context: &str, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::cancelled(context)),
        res = fut => res,
    }
}

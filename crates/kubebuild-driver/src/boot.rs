//! Bootstrap-then-connect with bounded retries.
//!
//! Independent invocations (parallel CI jobs, two users) may race to create the
//! same builder. Instead of locking, the race is accepted: its symptoms are
//! recognized by [`classify`] and turned into short jittered retries.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubebuild_common::retry::{sleep_or_cancel, Jitter};
use kubebuild_common::{classify, Disposition, Error, Result};

use crate::driver::{BuildEngineConnection, Driver, DriverStatus};
use crate::progress::ProgressWriter;

/// Maximum bootstrap attempts before giving up
pub const MAX_BOOT_RETRIES: u32 = 3;

/// Bring the driver's backend up if needed and connect to it.
///
/// Returns the connection and the name of the endpoint it targets.
pub async fn boot(
    ctx: &CancellationToken,
    driver: &dyn Driver,
    progress: &ProgressWriter,
    jitter: &mut dyn Jitter,
) -> Result<(BuildEngineConnection, String)> {
    let builder = driver.builder_name();
    let mut attempt = 0u32;
    let mut last_race: Option<Error> = None;

    loop {
        let info = driver.info(ctx).await?;
        attempt += 1;

        if info.status != DriverStatus::Running {
            if attempt > MAX_BOOT_RETRIES {
                let mut message = format!(
                    "failed to bootstrap builder after {} attempts",
                    MAX_BOOT_RETRIES
                );
                if let Some(last) = &last_race {
                    message = format!("{}: {}", message, last);
                }
                return Err(Error::bootstrap(&builder, message));
            }

            debug!(builder = %builder, status = %info.status, attempt, "bootstrapping builder");
            if let Err(e) = driver.bootstrap(ctx, progress).await {
                if classify(&e) != Disposition::BenignRace {
                    return Err(e);
                }
                // Most likely another invocation is creating the same
                // resources; give it time to finish.
                let delay = jitter.next_delay();
                warn!(
                    builder = %builder,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "bootstrap raced with another client, retrying"
                );
                last_race = Some(e);
                sleep_or_cancel(ctx, delay, "bootstrap retry").await?;
                continue;
            }
        }

        match driver.client(ctx).await {
            Ok((conn, endpoint)) => {
                info!(builder = %builder, endpoint = %endpoint, "connected to builder");
                return Ok((conn, endpoint));
            }
            Err(e)
                if classify(&e) == Disposition::NotRunning && attempt <= MAX_BOOT_RETRIES =>
            {
                debug!(builder = %builder, attempt, "builder not running yet");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::driver::{DriverInfo, MockDriver};

    /// Jitter with no delay that counts how often it was asked
    #[derive(Default)]
    struct CountingJitter {
        sleeps: u32,
    }

    impl Jitter for CountingJitter {
        fn next_delay(&mut self) -> Duration {
            self.sleeps += 1;
            Duration::ZERO
        }
    }

    fn info(status: DriverStatus) -> DriverInfo {
        DriverInfo {
            status,
            dynamic_nodes: vec![],
        }
    }

    fn connection(endpoint: &str) -> (BuildEngineConnection, String) {
        let (stream, _) = tokio::io::duplex(64);
        (
            BuildEngineConnection {
                endpoint: endpoint.to_string(),
                stream: Box::new(stream),
            },
            endpoint.to_string(),
        )
    }

    fn driver() -> MockDriver {
        let mut d = MockDriver::new();
        d.expect_builder_name().return_const("buildkit".to_string());
        d
    }

    #[tokio::test]
    async fn running_driver_connects_without_bootstrap() {
        let mut d = driver();
        d.expect_info()
            .times(1)
            .returning(|_| Ok(info(DriverStatus::Running)));
        d.expect_bootstrap().times(0);
        d.expect_client()
            .times(1)
            .returning(|_| Ok(connection("buildkit-0")));

        let ctx = CancellationToken::new();
        let mut jitter = CountingJitter::default();
        let (_, endpoint) = boot(&ctx, &d, &ProgressWriter::discard(), &mut jitter)
            .await
            .unwrap();
        assert_eq!(endpoint, "buildkit-0");
        assert_eq!(jitter.sleeps, 0);
    }

    #[tokio::test]
    async fn retries_benign_races_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let mut d = driver();
        d.expect_info()
            .returning(|_| Ok(info(DriverStatus::Inactive)));
        d.expect_bootstrap().times(3).returning(move |_, _| {
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::bootstrap(
                    "buildkit",
                    "deployments.apps \"buildkit\" already exists",
                ))
            } else {
                Ok(())
            }
        });
        d.expect_client()
            .times(1)
            .returning(|_| Ok(connection("buildkit-0")));

        let ctx = CancellationToken::new();
        let mut jitter = CountingJitter::default();
        boot(&ctx, &d, &ProgressWriter::discard(), &mut jitter)
            .await
            .unwrap();
        assert_eq!(jitter.sleeps, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_race_exhausts_budget() {
        let mut d = driver();
        d.expect_info()
            .returning(|_| Ok(info(DriverStatus::Inactive)));
        d.expect_bootstrap()
            .times(3)
            .returning(|_, _| Err(Error::internal("pods \"buildkit-0\" already exists")));
        d.expect_client().times(0);

        let ctx = CancellationToken::new();
        let mut jitter = CountingJitter::default();
        let err = boot(&ctx, &d, &ProgressWriter::discard(), &mut jitter)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"), "{err}");
        assert!(
            err.to_string().contains("pods \"buildkit-0\" already exists"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn other_bootstrap_errors_are_fatal() {
        let mut d = driver();
        d.expect_info()
            .returning(|_| Ok(info(DriverStatus::Inactive)));
        d.expect_bootstrap()
            .times(1)
            .returning(|_, _| Err(Error::internal("deployments.apps is forbidden")));
        d.expect_client().times(0);

        let ctx = CancellationToken::new();
        let mut jitter = CountingJitter::default();
        let err = boot(&ctx, &d, &ProgressWriter::discard(), &mut jitter)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("forbidden"));
        assert_eq!(jitter.sleeps, 0);
    }

    #[tokio::test]
    async fn not_running_client_rechecks_status() {
        let statuses = Arc::new(AtomicU32::new(0));
        let s = statuses.clone();

        let mut d = driver();
        d.expect_info().times(2).returning(move |_| {
            Ok(info(if s.fetch_add(1, Ordering::SeqCst) == 0 {
                DriverStatus::Starting
            } else {
                DriverStatus::Running
            }))
        });
        d.expect_bootstrap().times(1).returning(|_, _| Ok(()));
        let mut connects = 0;
        d.expect_client().times(2).returning(move |_| {
            connects += 1;
            if connects == 1 {
                Err(Error::NotRunning)
            } else {
                Ok(connection("buildkit-1"))
            }
        });

        let ctx = CancellationToken::new();
        let mut jitter = CountingJitter::default();
        let (_, endpoint) = boot(&ctx, &d, &ProgressWriter::discard(), &mut jitter)
            .await
            .unwrap();
        assert_eq!(endpoint, "buildkit-1");
    }

    #[tokio::test]
    async fn not_running_past_budget_is_returned() {
        let mut d = driver();
        d.expect_info()
            .returning(|_| Ok(info(DriverStatus::Running)));
        d.expect_client().times(4).returning(|_| Err(Error::NotRunning));

        let ctx = CancellationToken::new();
        let mut jitter = CountingJitter::default();
        let err = boot(&ctx, &d, &ProgressWriter::discard(), &mut jitter)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotRunning));
    }

    #[tokio::test]
    async fn not_connecting_is_fatal() {
        let mut d = driver();
        d.expect_info()
            .returning(|_| Ok(info(DriverStatus::Running)));
        d.expect_client()
            .times(1)
            .returning(|_| Err(Error::NotConnecting));

        let ctx = CancellationToken::new();
        let mut jitter = CountingJitter::default();
        let err = boot(&ctx, &d, &ProgressWriter::discard(), &mut jitter)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnecting));
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_sleep() {
        struct SlowJitter;
        impl Jitter for SlowJitter {
            fn next_delay(&mut self) -> Duration {
                Duration::from_secs(30)
            }
        }

        let ctx = CancellationToken::new();
        let trigger = ctx.clone();
        let mut d = driver();
        d.expect_info()
            .returning(|_| Ok(info(DriverStatus::Inactive)));
        d.expect_bootstrap().times(1).returning(move |_, _| {
            trigger.cancel();
            Err(Error::internal("already exists"))
        });

        let err = boot(&ctx, &d, &ProgressWriter::discard(), &mut SlowJitter)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}

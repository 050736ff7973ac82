//! Continuous polling loop.
//!
//! [`PollScheduler`] alternates between two states: idle, waiting on the
//! next interval tick, and polling, running one [`PollTask`] to completion.
//! Ticks never overlap. The first tick fires immediately and a tick missed
//! because a poll ran long is skipped rather than bursted.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};

use super::ingest::{IngestReport, Ingester};

/// Rejected polling interval.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalError {
    #[error("invalid duration {0:?}")]
    Malformed(String),
    #[error("interval must be positive, got {0:?}")]
    NotPositive(String),
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The store has no feeds
    NoFeed,
    /// One ingestion pass ran to completion
    Collected(IngestReport),
    /// The pass was abandoned; details were logged where it failed
    Failed,
}

/// Body of one scheduler tick.
pub trait PollTask {
    fn poll_next(&self) -> impl Future<Output = TickOutcome> + Send;
}

impl PollTask for Ingester {
    /// Ingest the feed that has waited longest.
    async fn poll_next(&self) -> TickOutcome {
        let feed = match self.database().get_next_feed_to_poll().await {
            Ok(Some(feed)) => feed,
            Ok(None) => return TickOutcome::NoFeed,
            Err(e) => {
                tracing::error!(error = %e, "Couldn't get next feed to fetch");
                return TickOutcome::Failed;
            }
        };

        tracing::info!(feed = %feed.name, url = %feed.url, "Collecting feed");
        match self.ingest(&feed).await {
            Ok(report) => TickOutcome::Collected(report),
            // Already logged by the ingester
            Err(_) => TickOutcome::Failed,
        }
    }
}

pub struct PollScheduler<T> {
    task: T,
    interval: Duration,
}

impl<T: PollTask> PollScheduler<T> {
    pub fn new(task: T, interval: Duration) -> Result<Self, IntervalError> {
        if interval.is_zero() {
            return Err(IntervalError::NotPositive(format!("{:?}", interval)));
        }
        Ok(Self { task, interval })
    }

    /// Poll forever.
    pub async fn run(&self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Poll until `shutdown` resolves. A poll in flight when it resolves is
    /// dropped at its next await point.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(interval = ?self.interval, "Collecting feeds every {:?}", self.interval);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = timer.tick() => {}
            }

            tracing::debug!(state = "polling", "Tick");
            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                outcome = self.task.poll_next() => outcome,
            };

            match outcome {
                TickOutcome::NoFeed => tracing::info!("No feeds to collect"),
                TickOutcome::Collected(report) => {
                    tracing::debug!(feed = %report.feed_name, saved = report.saved, "Tick done")
                }
                TickOutcome::Failed => tracing::debug!("Tick failed, moving on"),
            }
            tracing::debug!(state = "idle", "Waiting for next tick");
        }

        tracing::info!("Stopped collecting feeds");
    }
}

/// Parse a duration such as `"30s"`, `"1m"`, `"1h30m"` or `"1.5h"`.
///
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`; every number needs
/// one. Zero and negative values parse but are rejected as
/// [`IntervalError::NotPositive`].
pub fn parse_interval(input: &str) -> Result<Duration, IntervalError> {
    let malformed = || IntervalError::Malformed(input.to_string());
    let s = input.trim();

    let (negative, mut rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    // A bare zero needs no unit
    if rest == "0" {
        return Err(IntervalError::NotPositive(input.to_string()));
    }
    if rest.is_empty() {
        return Err(malformed());
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_len = leading_digits(rest);
        let int_part = &rest[..int_len];
        rest = &rest[int_len..];

        let mut frac_part = "";
        if let Some(after_dot) = rest.strip_prefix('.') {
            let frac_len = leading_digits(after_dot);
            frac_part = &after_dot[..frac_len];
            rest = &after_dot[frac_len..];
        }
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(malformed());
        }

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = unit_nanos(&rest[..unit_len]).ok_or_else(malformed)?;
        rest = &rest[unit_len..];

        let whole = if int_part.is_empty() {
            Some(0)
        } else {
            int_part.parse::<u128>().ok()
        };
        total = whole
            .and_then(|n| n.checked_mul(unit))
            .and_then(|n| n.checked_add(fraction_nanos(frac_part, unit)))
            .and_then(|n| total.checked_add(n))
            .ok_or_else(malformed)?;
    }

    let nanos = u64::try_from(total).map_err(|_| malformed())?;
    if negative || nanos == 0 {
        return Err(IntervalError::NotPositive(input.to_string()));
    }
    Ok(Duration::from_nanos(nanos))
}

fn leading_digits(s: &str) -> usize {
    s.bytes().take_while(u8::is_ascii_digit).count()
}

fn unit_nanos(unit: &str) -> Option<u128> {
    Some(match unit {
        "ns" => 1,
        "us" | "µs" | "μs" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        _ => return None,
    })
}

/// `0.<digits>` of `unit`, truncated to whole nanoseconds.
fn fraction_nanos(digits: &str, unit: u128) -> u128 {
    // Digits past 18 cannot change the result for any supported unit
    let digits = &digits[..digits.len().min(18)];
    if digits.is_empty() {
        return 0;
    }
    let numerator: u128 = digits.parse().unwrap_or(0);
    numerator * unit / 10u128.pow(digits.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::{sleep, Instant};

    /// Records when each tick started; optionally takes a while to finish.
    #[derive(Clone, Default)]
    struct FakeTask {
        starts: Arc<Mutex<Vec<Instant>>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        work: Duration,
    }

    impl FakeTask {
        fn taking(work: Duration) -> Self {
            Self {
                work,
                ..Self::default()
            }
        }

        fn ticks(&self) -> usize {
            self.starts.lock().unwrap().len()
        }
    }

    impl PollTask for FakeTask {
        async fn poll_next(&self) -> TickOutcome {
            self.starts.lock().unwrap().push(Instant::now());
            let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(n, Ordering::SeqCst);
            if !self.work.is_zero() {
                sleep(self.work).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            TickOutcome::NoFeed
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_immediate() {
        let task = FakeTask::default();
        let scheduler = PollScheduler::new(task.clone(), Duration::from_secs(60)).unwrap();
        let start = Instant::now();

        scheduler.run_until(sleep(Duration::from_secs(1))).await;

        assert_eq!(task.ticks(), 1);
        assert_eq!(task.starts.lock().unwrap()[0], start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_once_per_interval() {
        let task = FakeTask::default();
        let scheduler = PollScheduler::new(task.clone(), Duration::from_secs(60)).unwrap();
        let start = Instant::now();

        scheduler.run_until(sleep(Duration::from_secs(150))).await;

        let offsets: Vec<u64> = task
            .starts
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 60, 120]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_poll_never_overlaps() {
        let task = FakeTask::taking(Duration::from_secs(90));
        let scheduler = PollScheduler::new(task.clone(), Duration::from_secs(30)).unwrap();

        scheduler.run_until(sleep(Duration::from_secs(400))).await;

        assert_eq!(task.max_in_flight.load(Ordering::SeqCst), 1);
        let starts = task.starts.lock().unwrap();
        for pair in starts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_secs(90));
        }
        // Missed ticks are skipped, not replayed back to back
        assert!(starts.len() <= 5, "{} polls in 400s", starts.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_poll_in_flight() {
        let task = FakeTask::taking(Duration::from_secs(3600));
        let scheduler = PollScheduler::new(task.clone(), Duration::from_secs(60)).unwrap();
        let start = Instant::now();

        scheduler.run_until(sleep(Duration::from_secs(5))).await;

        assert_eq!(task.ticks(), 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = PollScheduler::new(FakeTask::default(), Duration::ZERO).err();
        assert!(matches!(err, Some(IntervalError::NotPositive(_))));
    }

    #[test]
    fn test_parse_interval_units() {
        assert_eq!(parse_interval("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_interval("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_interval(".5s").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval("+10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_interval(" 2m ").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn test_parse_interval_not_positive() {
        for input in ["0s", "0", "-1s", "-1m30s", "0h0m"] {
            assert!(
                matches!(parse_interval(input), Err(IntervalError::NotPositive(_))),
                "{input}"
            );
        }
    }

    #[test]
    fn test_parse_interval_malformed() {
        for input in ["", "abc", "10", "1x", "m", "1..5s", "-", "s10"] {
            assert!(
                matches!(parse_interval(input), Err(IntervalError::Malformed(_))),
                "{input}"
            );
        }
    }

    #[test]
    fn test_parse_interval_overflow_is_malformed() {
        assert!(matches!(
            parse_interval("9999999999999h"),
            Err(IntervalError::Malformed(_))
        ));
    }
}

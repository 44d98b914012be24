//! Poll timers: when to poll, decoupled from what polling does.

use crate::error::{ChannelError, ErrorSource};
use async_trait::async_trait;
use reactor_core::Backoff;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Work run on every tick.
#[async_trait]
pub trait PollDelegate: Send + Sync {
    /// One poll.
    async fn poll(&self) -> Result<(), ChannelError>;
}

/// Receives errors a timer gives up on reporting through its delegate.
pub type ErrorSink = Arc<dyn Fn(ChannelError) + Send + Sync>;

/// Schedules a [`PollDelegate`].
#[async_trait]
pub trait PollTimer: Send + Sync {
    /// Start ticking. No-op while already running.
    fn start(&self, delegate: Arc<dyn PollDelegate>);

    /// Stop ticking. No delegate call starts after this returns; one in
    /// flight may finish.
    fn stop(&self);

    /// Wait for the timer task to exit after [`stop`](Self::stop).
    async fn join(&self);

    /// Whether the timer is ticking.
    fn is_running(&self) -> bool;
}

/// Interval and retry settings for [`IntervalPollTimer`].
#[derive(Debug, Clone, Copy)]
pub struct PollTimerConfig {
    /// Pause between successful polls
    pub interval: Duration,
    /// Pause after failed polls
    pub backoff: Backoff,
    /// Consecutive failures before the error sink hears about it
    pub max_consecutive_failures: u32,
}

impl Default for PollTimerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            backoff: Backoff::new(Duration::from_millis(1000), Duration::from_millis(300_000)),
            max_consecutive_failures: 5,
        }
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls immediately on start, then once per interval after each poll
/// completes, so polls never overlap. Failed polls are retried with
/// backoff.
pub struct IntervalPollTimer {
    config: PollTimerConfig,
    error_sink: Option<ErrorSink>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for IntervalPollTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalPollTimer")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl IntervalPollTimer {
    /// Create a stopped timer.
    pub fn new(config: PollTimerConfig) -> Self {
        Self {
            config,
            error_sink: None,
            running: Mutex::new(None),
        }
    }

    /// Report persistent failures to `sink`.
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PollTimer for IntervalPollTimer {
    fn start(&self, delegate: Arc<dyn PollDelegate>) {
        let mut running = self.lock();
        if running.as_ref().is_some_and(|r| !*r.stop.borrow()) {
            return;
        }
        // A stopped task may still be in a poll; the new one starts after it.
        let previous = running.take().map(|r| r.handle);
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            delegate,
            self.config,
            self.error_sink.clone(),
            stop_rx,
            previous,
        ));
        *running = Some(Running { stop, handle });
    }

    fn stop(&self) {
        if let Some(running) = self.lock().as_ref() {
            running.stop.send_replace(true);
        }
    }

    async fn join(&self) {
        let handle = self.lock().take().map(|r| {
            r.stop.send_replace(true);
            r.handle
        });
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "poll timer task panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|r| !*r.stop.borrow() && !r.handle.is_finished())
    }
}

async fn run(
    delegate: Arc<dyn PollDelegate>,
    config: PollTimerConfig,
    error_sink: Option<ErrorSink>,
    mut stop: watch::Receiver<bool>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            tracing::error!(error = %e, "poll timer task panicked");
        }
    }
    let mut failures = 0u32;
    loop {
        if *stop.borrow_and_update() {
            break;
        }

        let delay = match delegate.poll().await {
            Ok(()) => {
                failures = 0;
                config.interval
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = config.backoff.delay(failures);
                tracing::warn!(failures, retry_in_ms = delay.as_millis() as u64, error = %e, "poll failed");
                if failures == config.max_consecutive_failures {
                    if let Some(sink) = &error_sink {
                        sink(e.retag(ErrorSource::Polling));
                    }
                }
                delay
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.wait_for(|stopped| *stopped) => break,
        }
    }
    tracing::debug!("poll timer stopped");
}

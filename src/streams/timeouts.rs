//! Stream timeout supervisor.
//!
//! Three independent deadlines guard each supervised stream:
//!
//! | Deadline | Armed | Reset | Cleared |
//! |---|---|---|---|
//! | Consume | on creation | never | first activity |
//! | Pull | every push/pull | every push/pull | end/abort |
//! | Finish | on creation (downloads) | never | end/abort |
//!
//! When one fires, the stream's remaining timers are cleared and the
//! [`TimeoutHandler`] is invoked to abort the stream with
//! [`StreamTimeout::reason`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Default Pull deadline.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default Consume deadline.
pub const DEFAULT_CONSUME_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default Finish deadline.
pub const DEFAULT_FINISH_TIMEOUT: Duration = Duration::from_millis(10000);

/// Named stream deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTimeout {
    Consume,
    Pull,
    Finish,
}

impl StreamTimeout {
    /// Abort reason used when this deadline fires.
    pub const fn reason(&self) -> &'static str {
        match self {
            StreamTimeout::Consume => "Consume timeout",
            StreamTimeout::Pull => "Pull timeout",
            StreamTimeout::Finish => "Finish timeout",
        }
    }
}

impl fmt::Display for StreamTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Deadline durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTimeoutConfig {
    pub pull: Duration,
    pub consume: Duration,
    pub finish: Duration,
}

impl StreamTimeoutConfig {
    fn duration(&self, kind: StreamTimeout) -> Duration {
        match kind {
            StreamTimeout::Consume => self.consume,
            StreamTimeout::Pull => self.pull,
            StreamTimeout::Finish => self.finish,
        }
    }
}

impl Default for StreamTimeoutConfig {
    fn default() -> Self {
        Self {
            pull: DEFAULT_PULL_TIMEOUT,
            consume: DEFAULT_CONSUME_TIMEOUT,
            finish: DEFAULT_FINISH_TIMEOUT,
        }
    }
}

/// Invoked with the stream id and the deadline that fired.
pub type TimeoutHandler = Arc<dyn Fn(u32, StreamTimeout) + Send + Sync>;

struct Timer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct TimerTable {
    timers: HashMap<(u32, StreamTimeout), Timer>,
    generation: u64,
}

impl TimerTable {
    fn clear_stream(&mut self, stream_id: u32) {
        self.timers.retain(|(id, _), timer| {
            if *id == stream_id {
                timer.handle.abort();
                false
            } else {
                true
            }
        });
    }
}

/// Per-registry timeout supervisor.
#[derive(Clone)]
pub struct StreamTimeouts {
    config: StreamTimeoutConfig,
    table: Arc<Mutex<TimerTable>>,
    handler: TimeoutHandler,
}

impl StreamTimeouts {
    pub fn new(config: StreamTimeoutConfig, handler: TimeoutHandler) -> Self {
        Self {
            config,
            table: Arc::new(Mutex::new(TimerTable::default())),
            handler,
        }
    }

    pub fn config(&self) -> &StreamTimeoutConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TimerTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm the deadlines of a new stream. Finish applies to downloads only.
    pub fn on_created(&self, stream_id: u32, with_finish: bool) {
        self.start(stream_id, StreamTimeout::Consume);
        if with_finish {
            self.start(stream_id, StreamTimeout::Finish);
        }
    }

    /// A push or pull happened: Consume is done, Pull restarts.
    pub fn on_activity(&self, stream_id: u32) {
        self.clear(stream_id, StreamTimeout::Consume);
        self.start(stream_id, StreamTimeout::Pull);
    }

    /// (Re)arm one deadline.
    pub fn start(&self, stream_id: u32, kind: StreamTimeout) {
        let deadline = Instant::now() + self.config.duration(kind);
        let mut table = self.lock();
        table.generation += 1;
        let generation = table.generation;

        let state = self.table.clone();
        let handler = self.handler.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fired = {
                let mut table = state.lock().unwrap_or_else(|e| e.into_inner());
                match table.timers.get(&(stream_id, kind)) {
                    Some(timer) if timer.generation == generation => {
                        table.timers.remove(&(stream_id, kind));
                        table.clear_stream(stream_id);
                        true
                    }
                    _ => false,
                }
            };
            if fired {
                tracing::warn!(stream_id, "{}", kind);
                handler(stream_id, kind);
            }
        })
        .abort_handle();

        if let Some(previous) = table
            .timers
            .insert((stream_id, kind), Timer { generation, handle })
        {
            previous.handle.abort();
        }
    }

    /// Disarm one deadline.
    pub fn clear(&self, stream_id: u32, kind: StreamTimeout) {
        if let Some(timer) = self.lock().timers.remove(&(stream_id, kind)) {
            timer.handle.abort();
        }
    }

    /// Disarm every deadline of a stream.
    pub fn clear_stream(&self, stream_id: u32) {
        self.lock().clear_stream(stream_id);
    }

    /// Disarm everything.
    pub fn clear_all(&self) {
        for (_, timer) in self.lock().timers.drain() {
            timer.handle.abort();
        }
    }

    /// Whether a deadline is currently armed.
    pub fn is_armed(&self, stream_id: u32, kind: StreamTimeout) -> bool {
        self.lock().timers.contains_key(&(stream_id, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn supervisor() -> (StreamTimeouts, mpsc::UnboundedReceiver<(u32, StreamTimeout)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: TimeoutHandler = Arc::new(move |id, kind| {
            let _ = tx.send((id, kind));
        });
        (StreamTimeouts::new(StreamTimeoutConfig::default(), handler), rx)
    }

    #[test]
    fn test_reasons() {
        assert_eq!(StreamTimeout::Consume.reason(), "Consume timeout");
        assert_eq!(StreamTimeout::Pull.to_string(), "Pull timeout");
        assert_eq!(StreamTimeout::Finish.reason(), "Finish timeout");
    }

    #[test]
    fn test_default_config() {
        let config = StreamTimeoutConfig::default();
        assert_eq!(config.pull, Duration::from_millis(5000));
        assert_eq!(config.consume, Duration::from_millis(5000));
        assert_eq!(config.finish, Duration::from_millis(10000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_fires_without_activity() {
        let (timeouts, mut rx) = supervisor();
        timeouts.on_created(1, true);

        tokio::time::sleep(Duration::from_millis(5001)).await;
        assert_eq!(rx.try_recv().unwrap(), (1, StreamTimeout::Consume));

        // Other timers cleared with it
        assert!(!timeouts.is_armed(1, StreamTimeout::Finish));
        tokio::time::sleep(Duration::from_millis(10000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_clears_consume_and_arms_pull() {
        let (timeouts, mut rx) = supervisor();
        timeouts.on_created(1, false);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        timeouts.on_activity(1);
        assert!(!timeouts.is_armed(1, StreamTimeout::Consume));
        assert!(timeouts.is_armed(1, StreamTimeout::Pull));

        // Consume would have fired at 5000
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(rx.try_recv().unwrap(), (1, StreamTimeout::Pull));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_restarts_on_each_activity() {
        let (timeouts, mut rx) = supervisor();
        timeouts.on_created(1, false);

        for _ in 0..4 {
            timeouts.on_activity(1);
            tokio::time::sleep(Duration::from_millis(4000)).await;
        }
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(rx.try_recv().unwrap(), (1, StreamTimeout::Pull));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_fires_despite_activity() {
        let (timeouts, mut rx) = supervisor();
        timeouts.on_created(1, true);

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(2100)).await;
            timeouts.on_activity(1);
        }
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert_eq!(rx.try_recv().unwrap(), (1, StreamTimeout::Finish));
        assert!(!timeouts.is_armed(1, StreamTimeout::Pull));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_stream_prevents_firing() {
        let (timeouts, mut rx) = supervisor();
        timeouts.on_created(1, true);
        timeouts.on_created(2, true);
        timeouts.clear_stream(1);

        tokio::time::sleep(Duration::from_millis(5001)).await;
        assert_eq!(rx.try_recv().unwrap(), (2, StreamTimeout::Consume));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all() {
        let (timeouts, mut rx) = supervisor();
        timeouts.on_created(1, true);
        timeouts.on_activity(2);
        timeouts.clear_all();

        tokio::time::sleep(Duration::from_millis(20000)).await;
        assert!(rx.try_recv().is_err());
    }
}

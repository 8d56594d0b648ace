//! Per-request heartbeat.
//!
//! Long-running steps (tunnel bootstrap, check-in over a slow network)
//! would otherwise look stalled to the operator. Each request handler
//! starts a [`Ticker`] that emits an elapsed-time
//! [`Event::Progress`](crate::session::Event) on a fixed cadence and
//! stops it when the step completes. Ticks use the lossy delivery
//! policy: a slow consumer drops heartbeats, never results.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::Event;

/// Cadence of heartbeat events.
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// One heartbeat emitted while a request executes.
#[derive(Clone, Debug)]
pub struct TickerEvent {
    /// The operation in flight, e.g. `bootstrap`.
    pub operation: String,
    /// Seconds elapsed since the operation started.
    pub elapsed_secs: f64,
}

/// A heartbeat task scoped to one request.
///
/// The task stops when [`stop`](Ticker::stop) is called or the handle is
/// dropped, whichever comes first.
pub(crate) struct Ticker {
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Starts the heartbeat for `operation`, emitting into `tx`.
    pub(crate) fn start(tx: mpsc::Sender<Event>, operation: &str) -> Self {
        Self::start_with_period(tx, operation, TICK_PERIOD)
    }

    pub(crate) fn start_with_period(
        tx: mpsc::Sender<Event>,
        operation: &str,
        period: Duration,
    ) -> Self {
        let operation = operation.to_string();
        let begin = Instant::now();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let event = Event::Progress(TickerEvent {
                    operation: operation.clone(),
                    elapsed_secs: begin.elapsed().as_secs_f64(),
                });
                if tx.try_send(event).is_err() {
                    tracing::warn!("ticker: dropping progress event: slow consumer");
                }
            }
        });
        Self { handle }
    }

    /// Stops the heartbeat.
    pub(crate) fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticker_emits_progress() {
        let (tx, mut rx) = mpsc::channel(16);
        let ticker = Ticker::start_with_period(tx, "testing", Duration::from_millis(10));
        let event = rx.recv().await.unwrap();
        match event {
            Event::Progress(tick) => {
                assert_eq!(tick.operation, "testing");
                assert!(tick.elapsed_secs >= 0.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        ticker.stop();
    }

    #[tokio::test]
    async fn test_ticker_stops_on_stop() {
        let (tx, mut rx) = mpsc::channel(16);
        let ticker = Ticker::start_with_period(tx, "testing", Duration::from_millis(5));
        let _ = rx.recv().await.unwrap();
        ticker.stop();
        // drain anything emitted before the abort landed
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ticker_drops_when_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        let ticker = Ticker::start_with_period(tx, "testing", Duration::from_millis(5));
        // queue fills after one tick; further ticks must not block the task
        tokio::time::sleep(Duration::from_millis(40)).await;
        ticker.stop();
    }
}

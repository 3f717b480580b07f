//! Adaptive-interval drain loop for inbound transport traffic.
//!
//! The engine pulls batches of messages off the transport at a cadence
//! that tracks load: any activity collapses the poll interval to its
//! minimum, while every idle tick backs the interval off by a fixed
//! increment up to a hard maximum. The result drains promptly under
//! traffic without spinning when the room is quiet.
//!
//! The loop runs on a dedicated worker thread. By default the engine
//! creates a private current-thread runtime for its timer; a host
//! application that already owns a runtime can instead hand the engine a
//! [`Handle`] and share its scheduler.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::proto::VPN_CHANNEL;
use crate::transport::{InboundMessage, Transport, TransportEvent};

/// Poll interval policy.
#[derive(Debug, Clone)]
pub struct PollTuning {
    /// Interval used while traffic is flowing
    pub min_interval: Duration,
    /// Ceiling reached after a long idle stretch
    pub max_interval: Duration,
    /// Backoff step added per idle tick
    pub increment: Duration,
    /// Upper bound on messages drained per tick, to bound latency
    pub max_batch: usize,
}

impl Default for PollTuning {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_micros(100),
            max_interval: Duration::from_millis(1),
            increment: Duration::from_micros(100),
            max_batch: 64,
        }
    }
}

/// Backoff state machine, mutated only by the engine worker.
///
/// The current interval always stays within `[min_interval, max_interval]`.
#[derive(Debug)]
pub struct PollState {
    current: Duration,
    min: Duration,
    max: Duration,
    increment: Duration,
}

impl PollState {
    /// Start at the fast end of the range.
    pub fn new(tuning: &PollTuning) -> Self {
        Self {
            current: tuning.min_interval,
            min: tuning.min_interval,
            max: tuning.max_interval,
            increment: tuning.increment,
        }
    }

    /// The interval to sleep before the next tick.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Account for one tick that drained `received` messages.
    pub fn on_tick(&mut self, received: usize) {
        if received > 0 {
            self.current = self.min;
        } else {
            self.current = (self.current + self.increment).min(self.max);
        }
    }
}

/// Receiver for drained traffic, invoked synchronously on the engine
/// thread. Heavy work belongs on the handler's own threads.
pub trait InboundHandler: Send + Sync {
    /// A non-empty batch of inbound messages.
    fn on_batch(&self, batch: Vec<InboundMessage>);

    /// A queued session lifecycle event.
    fn on_event(&self, event: TransportEvent);
}

/// The poll engine worker.
///
/// `stop()` is cooperative: it flips the running flag, wakes the sleeper,
/// and joins the worker. No handler invocation happens after `stop()`
/// returns.
pub struct PollEngine {
    stop_tx: watch::Sender<bool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl PollEngine {
    /// Start the engine on its own thread with a private runtime.
    pub fn start(
        tuning: PollTuning,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        Self::spawn(tuning, transport, handler, None)
    }

    /// Start the engine on its own thread, driving the loop on an
    /// externally supplied runtime.
    pub fn start_on(
        handle: Handle,
        tuning: PollTuning,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        Self::spawn(tuning, transport, handler, Some(handle))
    }

    fn spawn(
        tuning: PollTuning,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn InboundHandler>,
        handle: Option<Handle>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = thread::Builder::new()
            .name("roomnet-poll".into())
            .spawn(move || match handle {
                Some(handle) => handle.block_on(run_loop(tuning, transport, handler, stop_rx)),
                None => {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_time()
                        .build()
                        .expect("failed to build poll runtime");
                    runtime.block_on(run_loop(tuning, transport, handler, stop_rx));
                }
            })
            .expect("failed to spawn poll thread");

        Self {
            stop_tx,
            worker: Some(worker),
        }
    }

    /// Stop the engine and wait for the worker to exit.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("poll worker panicked");
            }
        }
    }
}

impl Drop for PollEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    tuning: PollTuning,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn InboundHandler>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut state = PollState::new(&tuning);
    debug!(
        "poll engine running: min={:?} max={:?} step={:?} batch={}",
        tuning.min_interval, tuning.max_interval, tuning.increment, tuning.max_batch
    );

    loop {
        if *stop_rx.borrow() {
            break;
        }

        for event in transport.poll_events() {
            handler.on_event(event);
        }

        let batch = transport.drain(VPN_CHANNEL, tuning.max_batch);
        let received = batch.len();
        if received > 0 {
            handler.on_batch(batch);
        }
        state.on_tick(received);

        tokio::select! {
            _ = tokio::time::sleep(state.current()) => {}
            _ = stop_rx.changed() => break,
        }
    }

    debug!("poll engine stopped");
}

//! The session task.
//!
//! One spawned task owns the [`SessionEngine`] and processes socket events
//! and timer ticks strictly one at a time. Everything else talks to it
//! through a cloneable [`SessionHub`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};

use super::connection::{ConnectionHandle, ConnectionId, Outbound};
use super::engine::SessionEngine;
use super::ids;
use super::protocol::ClientMessage;
use crate::error::{Result, SessionError};

/// Timer periods for the session task
#[derive(Debug, Clone, Copy)]
pub struct HubTimers {
    pub flush: Duration,
    pub heartbeat: Duration,
    pub sweep: Duration,
}

#[derive(Debug)]
pub enum SessionEvent {
    Opened(ConnectionHandle),
    Inbound {
        id: ConnectionId,
        message: ClientMessage,
    },
    /// Transport-level liveness acknowledgment
    Alive(ConnectionId),
    Closed(ConnectionId),
    /// Flush and stop the task
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct SessionHub {
    sender: mpsc::UnboundedSender<SessionEvent>,
    next_connection: Arc<AtomicU64>,
}

impl SessionHub {
    /// Spawn the session task around `engine`
    pub fn spawn(engine: SessionEngine, timers: HubTimers) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run(engine, receiver, timers));

        Self {
            sender,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Allocate an id for a new socket and announce it to the session task
    pub fn open(&self, sender: mpsc::UnboundedSender<Outbound>) -> ConnectionHandle {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let handle = ConnectionHandle::new(id, sender);
        self.emit(SessionEvent::Opened(handle.clone()));
        handle
    }

    pub fn inbound(&self, id: ConnectionId, message: ClientMessage) {
        self.emit(SessionEvent::Inbound { id, message });
    }

    pub fn alive(&self, id: ConnectionId) {
        self.emit(SessionEvent::Alive(id));
    }

    pub fn closed(&self, id: ConnectionId) {
        self.emit(SessionEvent::Closed(id));
    }

    /// Ask the session task to flush and stop, waiting until it has
    pub async fn shutdown(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.sender
            .send(SessionEvent::Shutdown(done_tx))
            .map_err(|_| SessionError::internal("session task already stopped"))?;
        done_rx
            .await
            .map_err(|_| SessionError::internal("session task stopped before flushing"))
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.sender.send(event) {
            tracing::error!(error = %e, "Session task is not running");
        }
    }
}

/// Shortest timer period the session task will run
const MIN_TICK: Duration = Duration::from_millis(1);

fn ticker(period: Duration) -> Interval {
    // interval() panics on a zero period
    let mut timer = interval(period.max(MIN_TICK));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

async fn run(mut engine: SessionEngine, mut receiver: mpsc::UnboundedReceiver<SessionEvent>, timers: HubTimers) {
    tracing::info!(
        flush_secs = timers.flush.as_secs(),
        heartbeat_secs = timers.heartbeat.as_secs(),
        sweep_secs = timers.sweep.as_secs(),
        "Session task started"
    );

    let mut flush = ticker(timers.flush);
    let mut heartbeat = ticker(timers.heartbeat);
    let mut sweep = ticker(timers.sweep);
    // interval() fires immediately; skip that first round so fresh sockets
    // get a full period before their first probe
    heartbeat.reset();

    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Some(SessionEvent::Shutdown(done)) => {
                    engine.flush();
                    let _ = done.send(());
                    break;
                }
                Some(event) => guarded("event", || dispatch(&mut engine, event)),
                None => {
                    engine.flush();
                    break;
                }
            },
            _ = flush.tick() => guarded("flush", || engine.flush()),
            _ = heartbeat.tick() => guarded("heartbeat", || engine.check_liveness()),
            _ = sweep.tick() => guarded("sweep", || {
                engine.sweep_expired(ids::unix_millis());
            }),
        }
    }

    tracing::info!("Session task stopped");
}

fn dispatch(engine: &mut SessionEngine, event: SessionEvent) {
    match event {
        SessionEvent::Opened(handle) => engine.open_connection(handle),
        SessionEvent::Inbound { id, message } => engine.handle_message(id, message),
        SessionEvent::Alive(id) => engine.mark_alive(id),
        SessionEvent::Closed(id) => engine.close_connection(id),
        SessionEvent::Shutdown(_) => {}
    }
}

/// Last-resort catch-all: a panicking handler is logged and the task keeps
/// serving events.
fn guarded(what: &str, f: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(handler = what, reason = %reason, "Session handler panicked");
    }
}

//! Per-switch control event listener.
//!
//! A capture task pulls frames from the switch's [`FrameSource`] into a
//! bounded queue; a dispatch worker classifies each frame once and hands it
//! to the matching handler. Frames arriving while the queue is full are
//! dropped and counted. On cancellation the capture task stops, the frame
//! being dispatched completes, and the listener reaches
//! [`ListenerState::Stopped`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{classify, ControlEvent};
use crate::control::ForwardingControl;
use crate::frame_source::FrameSource;
use crate::handlers::{MacLearningHandler, RttReportHandler, TelemetrySink};
use crate::snapshot::VplsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerState {
    Listening,
    Stopped,
}

/// Frame counters of one listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    received: AtomicU64,
    mac_learning: AtomicU64,
    rtt_reports: AtomicU64,
    unknown: AtomicU64,
    decode_errors: AtomicU64,
    queue_drops: AtomicU64,
    handler_errors: AtomicU64,
}

impl ListenerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            mac_learning: self.mac_learning.load(Ordering::Relaxed),
            rtt_reports: self.rtt_reports.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub mac_learning: u64,
    pub rtt_reports: u64,
    pub unknown: u64,
    pub decode_errors: u64,
    pub queue_drops: u64,
    pub handler_errors: u64,
}

/// Final state of a listener, returned when it stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerReport {
    pub switch: String,
    pub state: ListenerState,
    pub stats: StatsSnapshot,
}

/// Routes classified frames to their handlers.
struct Dispatcher {
    switch: String,
    mac_learning: MacLearningHandler,
    rtt: RttReportHandler,
    stats: Arc<ListenerStats>,
}

impl Dispatcher {
    async fn dispatch(&mut self, frame: &[u8]) {
        let event = match classify(frame) {
            Ok(event) => event,
            Err(e) => {
                ListenerStats::bump(&self.stats.decode_errors);
                warn!(switch = %self.switch, len = frame.len(), error = %e, "Dropping undecodable frame");
                return;
            }
        };
        trace!(switch = %self.switch, kind = event.kind(), "Dispatching control event");

        match event {
            ControlEvent::MacLearning(header) => {
                ListenerStats::bump(&self.stats.mac_learning);
                if let Err(e) = self.mac_learning.handle(&header).await {
                    ListenerStats::bump(&self.stats.handler_errors);
                    warn!(switch = %self.switch, mac = %header.src_addr, error = %e, "MAC learning failed");
                }
            }
            ControlEvent::RttReport(header) => {
                ListenerStats::bump(&self.stats.rtt_reports);
                self.rtt.handle(&header);
            }
            ControlEvent::Unknown(ethertype) => {
                ListenerStats::bump(&self.stats.unknown);
                trace!(switch = %self.switch, ethertype, "Ignoring frame");
            }
        }
    }
}

pub struct EventListener {
    switch: String,
    source: Box<dyn FrameSource>,
    dispatcher: Dispatcher,
    queue_depth: usize,
    stats: Arc<ListenerStats>,
    state: watch::Sender<ListenerState>,
}

impl EventListener {
    pub fn new(
        control: Arc<dyn ForwardingControl>,
        source: Box<dyn FrameSource>,
        snapshot: Arc<VplsSnapshot>,
        sink: Arc<dyn TelemetrySink>,
        queue_depth: usize,
    ) -> Self {
        let switch = control.switch_name().to_string();
        let stats = Arc::new(ListenerStats::default());
        let (state, _) = watch::channel(ListenerState::Listening);
        Self {
            dispatcher: Dispatcher {
                switch: switch.clone(),
                mac_learning: MacLearningHandler::new(control, snapshot),
                rtt: RttReportHandler::new(switch.clone(), sink),
                stats: stats.clone(),
            },
            switch,
            source,
            queue_depth: queue_depth.max(1),
            stats,
            state,
        }
    }

    pub fn switch_name(&self) -> &str {
        &self.switch
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        self.stats.clone()
    }

    /// Watches the listener's state.
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Runs until `cancel` fires or the frame source ends.
    pub async fn run(self, cancel: CancellationToken) -> ListenerReport {
        let Self {
            switch,
            mut source,
            mut dispatcher,
            queue_depth,
            stats,
            state,
        } = self;

        info!(switch = %switch, interface = source.interface(), queue_depth, "Listener started");

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(queue_depth);
        let capture_cancel = cancel.clone();
        let capture_stats = stats.clone();
        let capture_switch = switch.clone();

        let capture = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = capture_cancel.cancelled() => break,
                    frame = source.next_frame() => frame,
                };
                match frame {
                    Ok(Some(frame)) => {
                        ListenerStats::bump(&capture_stats.received);
                        match tx.try_send(frame) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                ListenerStats::bump(&capture_stats.queue_drops);
                                debug!(switch = %capture_switch, "Dispatch queue full, dropping frame");
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                    Ok(None) => {
                        info!(switch = %capture_switch, "Frame source closed");
                        break;
                    }
                    Err(e) => {
                        error!(switch = %capture_switch, error = %e, "Frame capture failed");
                        break;
                    }
                }
            }
        });

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            dispatcher.dispatch(&frame).await;
        }
        drop(rx);

        if let Err(e) = capture.await {
            error!(switch = %switch, error = %e, "Capture task panicked");
        }

        state.send_replace(ListenerState::Stopped);
        let stats = stats.snapshot();
        info!(
            switch = %switch,
            received = stats.received,
            decode_errors = stats.decode_errors,
            queue_drops = stats.queue_drops,
            "Listener stopped"
        );
        ListenerReport {
            switch,
            state: ListenerState::Stopped,
            stats,
        }
    }
}

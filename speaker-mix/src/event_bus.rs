//! Event bus between pipeline elements and the orchestrator
//!
//! Elements hold an [`EventReporter`] and raise reports from whatever thread
//! they run on. The orchestrator owns the single [`EventBus`] receiver and
//! pulls at most one message per [`EventBus::poll`].
//!
//! Delivery order is the order reports were raised. Reports from a pipeline
//! whose listener has been removed are dropped, including ones already queued.

use speaker_common::{
    ElementId, ElementStatus, EventMessage, PeripheralStatus, PipelineIndex, SampleFormat,
    SourceKind,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Which reports the orchestrator is listening to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listener {
    Pipeline(PipelineIndex),
    Peripherals,
}

impl Listener {
    fn of(msg: &EventMessage) -> Self {
        match msg.source_kind {
            SourceKind::Element => Listener::Pipeline(msg.source.pipeline),
            SourceKind::Peripheral => Listener::Peripherals,
        }
    }
}

#[derive(Debug, Default)]
struct Removed {
    listeners: Mutex<HashSet<Listener>>,
}

impl Removed {
    fn lock(&self) -> MutexGuard<'_, HashSet<Listener>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn contains(&self, listener: Listener) -> bool {
        self.lock().contains(&listener)
    }

    fn insert(&self, listener: Listener) -> bool {
        self.lock().insert(listener)
    }

    fn remove(&self, listener: Listener) -> bool {
        self.lock().remove(&listener)
    }
}

/// Sending half handed to one element
#[derive(Debug, Clone)]
pub struct EventReporter {
    id: ElementId,
    tx: mpsc::UnboundedSender<EventMessage>,
    removed: Arc<Removed>,
}

impl EventReporter {
    pub fn id(&self) -> ElementId {
        self.id
    }

    /// Report a status change for run `run`
    pub fn status(&self, run: u64, status: ElementStatus) {
        self.send(EventMessage::status(self.id, run, status));
    }

    /// Report the stream format detected during run `run`
    pub fn music_info(&self, run: u64, format: SampleFormat) {
        self.send(EventMessage::music_info(self.id, run, format));
    }

    fn send(&self, msg: EventMessage) {
        if self.removed.contains(Listener::Pipeline(self.id.pipeline)) {
            trace!("No listener for {}, dropping report", self.id);
            return;
        }
        // Receiver gone means the bus was closed at terminate
        if self.tx.send(msg).is_err() {
            trace!("Event bus closed, dropping report from {}", self.id);
        }
    }
}

/// Sending half for peripherals
#[derive(Debug, Clone)]
pub struct PeripheralReporter {
    tx: mpsc::UnboundedSender<EventMessage>,
}

impl PeripheralReporter {
    pub fn report(&self, status: PeripheralStatus) {
        let _ = self.tx.send(EventMessage::peripheral(status));
    }
}

/// Receiving end of the event bus
pub struct EventBus {
    tx: mpsc::UnboundedSender<EventMessage>,
    rx: mpsc::UnboundedReceiver<EventMessage>,
    removed: Arc<Removed>,
    closed: bool,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            removed: Arc::new(Removed::default()),
            closed: false,
        }
    }

    /// Create a reporter for element `id`
    pub fn reporter(&self, id: ElementId) -> EventReporter {
        EventReporter {
            id,
            tx: self.tx.clone(),
            removed: Arc::clone(&self.removed),
        }
    }

    pub fn peripheral_reporter(&self) -> PeripheralReporter {
        PeripheralReporter {
            tx: self.tx.clone(),
        }
    }

    /// Wait up to `timeout` for the next message
    ///
    /// Returns `None` on timeout or once the bus is closed.
    pub async fn poll(&mut self, timeout: Duration) -> Option<EventMessage> {
        if self.closed {
            return None;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) | Err(_) => return None,
            };

            if self.removed.contains(Listener::of(&msg)) {
                trace!("Discarding queued report from {}", msg.source);
                continue;
            }
            return Some(msg);
        }
    }

    /// Stop delivering reports for `listener`
    pub fn remove_listener(&self, listener: Listener) {
        if self.removed.insert(listener) {
            debug!("Removed event listener {:?}", listener);
        }
    }

    /// Resume delivering reports for `listener`
    pub fn add_listener(&self, listener: Listener) {
        if self.removed.remove(listener) {
            debug!("Added event listener {:?}", listener);
        }
    }

    /// Close the bus; pending and future reports are dropped
    pub fn close(&mut self) {
        if !self.closed {
            self.rx.close();
            while self.rx.try_recv().is_ok() {}
            self.closed = true;
            debug!("Event bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use speaker_common::{Completion, ElementKind};

    fn decoder(index: usize) -> ElementId {
        ElementId::new(PipelineIndex::Source(index), ElementKind::Decoder)
    }

    #[tokio::test]
    async fn test_poll_times_out_when_empty() {
        let mut bus = EventBus::new();
        let start = std::time::Instant::now();
        assert!(bus.poll(Duration::from_millis(30)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let mut bus = EventBus::new();
        let reporter = bus.reporter(decoder(0));

        reporter.status(1, ElementStatus::Running);
        reporter.music_info(1, SampleFormat::new(22050, 2, 16));
        reporter.status(1, ElementStatus::Finished(Completion::EndOfStream));

        let timeout = Duration::from_millis(10);
        let first = bus.poll(timeout).await.unwrap();
        assert!(matches!(
            first.command,
            speaker_common::EventCommand::ReportStatus(ElementStatus::Running)
        ));
        assert_eq!(
            bus.poll(timeout).await.unwrap().decoded_format(),
            Some(SampleFormat::new(22050, 2, 16))
        );
        assert!(bus.poll(timeout).await.unwrap().finished().is_some());
        assert!(bus.poll(timeout).await.is_none());
    }

    #[tokio::test]
    async fn test_report_from_another_thread() {
        let mut bus = EventBus::new();
        let reporter = bus.reporter(decoder(1));

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            reporter.status(4, ElementStatus::Running);
        });

        let msg = bus.poll(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.run, 4);
        assert_eq!(msg.source, decoder(1));
    }

    #[tokio::test]
    async fn test_removed_listener_drops_queued_and_new_reports() {
        let mut bus = EventBus::new();
        let zero = bus.reporter(decoder(0));
        let one = bus.reporter(decoder(1));

        zero.status(1, ElementStatus::Running);
        bus.remove_listener(Listener::Pipeline(PipelineIndex::Source(0)));
        zero.status(1, ElementStatus::Stopped);
        one.status(1, ElementStatus::Running);

        let msg = bus.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(msg.source, decoder(1));
        assert!(bus.poll(Duration::from_millis(10)).await.is_none());

        bus.add_listener(Listener::Pipeline(PipelineIndex::Source(0)));
        zero.status(2, ElementStatus::Running);
        assert_eq!(bus.poll(Duration::from_millis(10)).await.unwrap().run, 2);
    }

    #[tokio::test]
    async fn test_peripheral_reports() {
        let mut bus = EventBus::new();
        bus.peripheral_reporter().report(PeripheralStatus::Mounted);

        let msg = bus.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(msg.source_kind, SourceKind::Peripheral);

        bus.remove_listener(Listener::Peripherals);
        bus.peripheral_reporter().report(PeripheralStatus::Unmounted);
        assert!(bus.poll(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_closed_bus_returns_none() {
        let mut bus = EventBus::new();
        let reporter = bus.reporter(decoder(0));
        reporter.status(1, ElementStatus::Running);

        bus.close();
        bus.close();
        assert!(bus.is_closed());
        assert!(bus.poll(Duration::from_millis(10)).await.is_none());

        // Sending after close is silently dropped
        reporter.status(1, ElementStatus::Stopped);
    }
}

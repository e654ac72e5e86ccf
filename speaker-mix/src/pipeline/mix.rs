//! Mix pipeline: mixer task → bounded channel → output sink task
//!
//! The mixer task paces itself at one chunk per chunk period and never waits
//! on a source. The sink task applies the volume and writes to the transport.
//! Both tasks observe a [`watch`] channel carrying the current [`MixCommand`].
//!
//! The transport moves into the sink task while the pipeline runs and is
//! handed back when the sink exits, so a stopped pipeline can be restarted.

use crate::audio::transport::OutputTransport;
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, EventReporter};
use crate::pipeline::element::StateCell;
use crate::pipeline::mixer::{Mixer, MixerCore};
use crate::pipeline::sink::{run_sink, VolumeControl};
use speaker_common::{ElementId, ElementKind, ElementStatus, PipelineIndex, PipelineState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Command observed by the mix and sink tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixCommand {
    Run,
    Pause,
    Stop,
}

struct MixTasks {
    control: watch::Sender<MixCommand>,
    mixer: JoinHandle<()>,
    sink: JoinHandle<Box<dyn OutputTransport>>,
}

/// The combined mixer + output pipeline
pub struct MixPipeline {
    state: StateCell,
    mixer: Arc<Mixer>,
    volume: Arc<VolumeControl>,
    queue_chunks: usize,
    transport: Option<Box<dyn OutputTransport>>,
    tasks: Option<MixTasks>,
    mixer_reporter: EventReporter,
    output_reporter: EventReporter,
    run: u64,
}

impl MixPipeline {
    pub fn new(
        mixer: Arc<Mixer>,
        transport: Box<dyn OutputTransport>,
        volume: Arc<VolumeControl>,
        queue_chunks: usize,
        bus: &EventBus,
    ) -> Self {
        Self {
            state: StateCell::new(PipelineState::Init),
            mixer,
            volume,
            queue_chunks: queue_chunks.max(1),
            transport: Some(transport),
            tasks: None,
            mixer_reporter: bus.reporter(ElementId::new(PipelineIndex::Mix, ElementKind::Mixer)),
            output_reporter: bus.reporter(ElementId::new(PipelineIndex::Mix, ElementKind::OutputWriter)),
            run: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn mixer(&self) -> &Arc<Mixer> {
        &self.mixer
    }

    pub fn run(&self) -> u64 {
        self.run
    }

    /// `Init | Stopped` → `Running`: spawn the mixer and sink tasks
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        if !state.can_start() {
            return Err(Error::invalid_state(PipelineIndex::Mix, state, "already started"));
        }
        let transport = self
            .transport
            .take()
            .ok_or_else(|| Error::Output("output transport unavailable".to_string()))?;

        if let Err(state) = self.state.transition_from(|s| s.can_start(), PipelineState::Running) {
            self.transport = Some(transport);
            return Err(Error::invalid_state(PipelineIndex::Mix, state, "already started"));
        }

        self.run += 1;
        let (control_tx, control_rx) = watch::channel(MixCommand::Run);
        let (chunk_tx, chunk_rx) = mpsc::channel(self.queue_chunks);

        let sink = tokio::spawn(run_sink(
            transport,
            chunk_rx,
            Arc::clone(&self.volume),
            control_rx.clone(),
        ));
        let mixer = tokio::spawn(run_mixer(
            MixerCore::new(Arc::clone(&self.mixer)),
            Duration::from_millis(self.mixer.chunk_ms()),
            chunk_tx,
            control_rx,
        ));

        self.tasks = Some(MixTasks {
            control: control_tx,
            mixer,
            sink,
        });

        self.mixer_reporter.status(self.run, ElementStatus::Running);
        self.output_reporter.status(self.run, ElementStatus::Running);
        info!("Mix pipeline started (run {})", self.run);
        Ok(())
    }

    /// `Running` → `Paused`: the mixer stops producing chunks
    pub fn pause(&mut self) -> Result<()> {
        self.state
            .transition(PipelineState::Running, PipelineState::Paused)
            .map_err(|state| Error::invalid_state(PipelineIndex::Mix, state, "not running"))?;
        self.send(MixCommand::Pause);
        self.mixer_reporter.status(self.run, ElementStatus::Paused);
        info!("Mix pipeline paused");
        Ok(())
    }

    /// `Paused` → `Running`
    pub fn resume(&mut self) -> Result<()> {
        self.state
            .transition(PipelineState::Paused, PipelineState::Running)
            .map_err(|state| Error::invalid_state(PipelineIndex::Mix, state, "not paused"))?;
        self.send(MixCommand::Run);
        self.mixer_reporter.status(self.run, ElementStatus::Running);
        info!("Mix pipeline resumed");
        Ok(())
    }

    fn send(&self, command: MixCommand) {
        if let Some(tasks) = &self.tasks {
            // Receivers only drop when both tasks have exited
            let _ = tasks.control.send(command);
        }
    }

    /// Stop both tasks, clear queued output and return to `Init`
    ///
    /// Idempotent.
    pub async fn stop_and_reset(&mut self) {
        let previous = self.state();

        if let Some(tasks) = self.tasks.take() {
            let _ = self.state.transition_from(
                |s| matches!(s, PipelineState::Running | PipelineState::Paused),
                PipelineState::Stopped,
            );
            let _ = tasks.control.send(MixCommand::Stop);

            if let Err(e) = tasks.mixer.await {
                error!("Mixer task failed: {}", e);
            }
            match tasks.sink.await {
                Ok(mut transport) => {
                    transport.clear();
                    self.transport = Some(transport);
                }
                Err(e) => error!("Output sink task failed, transport lost: {}", e),
            }
            self.mixer_reporter.status(self.run, ElementStatus::Stopped);
        }

        self.state.set(PipelineState::Init);
        if previous != PipelineState::Init {
            info!("Mix pipeline reset from {}", previous);
        }
    }

    /// Release the transport; the pipeline must already be reset
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            debug!("Output transport closed");
        }
    }
}

/// Mixer task body
async fn run_mixer(
    mut core: MixerCore,
    period: Duration,
    chunks: mpsc::Sender<Vec<f32>>,
    mut control: watch::Receiver<MixCommand>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("Mixer task started, {:?} per chunk", period);

    loop {
        tokio::select! {
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = interval.tick() => {}
        }

        let command = *control.borrow();
        match command {
            MixCommand::Stop => break,
            MixCommand::Pause => continue,
            MixCommand::Run => {}
        }

        let chunk = core.mix_chunk();
        if chunks.send(chunk).await.is_err() {
            debug!("Output sink gone, mixer exiting");
            break;
        }
    }

    debug!("Mixer task stopped");
}

//! Playback orchestrator
//!
//! Owns every source pipeline, the mix pipeline and the event bus, and is the
//! only writer of lifecycle state on the control plane.
//!
//! **State machine (per pipeline):**
//! `Init → Running → {Paused ⇄ Running} → Finished | Stopped → Init`
//!
//! **Event handling:** each [`Orchestrator::handle_events`] call pulls at most
//! one message from the bus. A decoder's music info updates that source's
//! mixer slot; a `Finished` report from any element of a source resets that
//! source only. Reports from an earlier run of a pipeline are ignored.
//!
//! **Self-healing:** whenever the mix pipeline is idle and at least one source
//! has a URI, `handle_events` starts every startable source and the mix.

use crate::audio::raw_buffer::RawBuffer;
use crate::audio::transport::OutputTransport;
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, Listener};
use crate::pipeline::{MixPipeline, Mixer, SourcePipeline, VolumeControl};
use crate::storage::{wait_until_mounted, Storage};
use speaker_common::config::SystemConfig;
use speaker_common::{
    Completion, EventMessage, PeripheralStatus, PipelineIndex, PipelineState, SampleFormat,
    SourceKind,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Playback controller
pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    sources: Vec<SourcePipeline>,
    mix: MixPipeline,
    bus: EventBus,
    volume: Arc<VolumeControl>,
    poll_timeout: Duration,
    terminated: bool,
}

impl Orchestrator {
    /// Bring up storage, pipelines, mixer, output and event bus
    ///
    /// Waits for the storage peripheral to mount (bounded retry with backoff)
    /// and configures the transport for the destination format. Any failure
    /// here is an [`Error::Init`] (or [`Error::Config`] for bad settings) and
    /// leaves nothing running.
    pub async fn initialize(
        config: SystemConfig,
        storage: Arc<dyn Storage>,
        transport: Box<dyn OutputTransport>,
    ) -> Result<Self> {
        config.validate().map_err(|e| match e {
            speaker_common::Error::Config(msg) => Error::Config(msg),
            other => Error::Config(other.to_string()),
        })?;

        storage
            .start()
            .map_err(|e| Error::Init(format!("storage failed to start: {}", e)))?;

        match Self::build(&config, Arc::clone(&storage), transport).await {
            Ok(orchestrator) => {
                info!(
                    "Orchestrator initialized: {} sources, output {}, volume {}",
                    config.source_count, config.mixer.destination, config.default_volume_db
                );
                Ok(orchestrator)
            }
            Err(e) => {
                error!("Initialization failed: {}", e);
                storage.stop();
                Err(e)
            }
        }
    }

    async fn build(
        config: &SystemConfig,
        storage: Arc<dyn Storage>,
        mut transport: Box<dyn OutputTransport>,
    ) -> Result<Self> {
        wait_until_mounted(storage.as_ref(), &config.storage).await?;

        let bus = EventBus::new();
        bus.peripheral_reporter().report(PeripheralStatus::Mounted);

        let source_format = config.mixer.default_source;
        let capacity = config.raw_buffer_samples();
        let buffers: Vec<Arc<RawBuffer>> = (0..config.source_count)
            .map(|_| Arc::new(RawBuffer::new(capacity)))
            .collect();

        let mixer = Mixer::configure(
            buffers.clone(),
            source_format,
            config.mixer.downmix(),
            config.mixer.destination,
            config.mixer.chunk_ms,
        )?;

        let sources = buffers
            .into_iter()
            .enumerate()
            .map(|(index, buffer)| {
                SourcePipeline::new(index, buffer, source_format, Arc::clone(&storage), &bus)
            })
            .collect();

        transport
            .configure(config.mixer.destination)
            .map_err(|e| Error::Init(format!("output transport: {}", e)))?;

        let volume = Arc::new(VolumeControl::new(config.default_volume_db));
        let mix = MixPipeline::new(
            Arc::new(mixer),
            transport,
            Arc::clone(&volume),
            config.buffers.output_queue_chunks,
            &bus,
        );

        Ok(Self {
            storage,
            sources,
            mix,
            bus,
            volume,
            poll_timeout: config.poll_timeout(),
            terminated: false,
        })
    }

    /// Number of source pipelines
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn ensure_active(&self, index: PipelineIndex) -> Result<()> {
        if self.terminated {
            return Err(Error::invalid_state(index, PipelineState::Init, "terminated"));
        }
        Ok(())
    }

    fn source(&self, index: usize) -> Result<&SourcePipeline> {
        self.sources
            .get(index)
            .ok_or(Error::InvalidIndex(PipelineIndex::Source(index)))
    }

    fn source_mut(&mut self, index: usize) -> Result<&mut SourcePipeline> {
        self.sources
            .get_mut(index)
            .ok_or(Error::InvalidIndex(PipelineIndex::Source(index)))
    }

    /// Log a command outcome; rejected commands are warnings, never fatal
    fn outcome(command: &str, index: PipelineIndex, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => info!("{}({}) ok", command, index),
            Err(e) => warn!("{}({}) rejected: {}", command, index, e),
        }
        result
    }

    /// Set the URI source `index` plays on its next run
    pub fn assign_source(&mut self, index: usize, uri: &str) -> Result<()> {
        let pipeline = PipelineIndex::Source(index);
        let result = match self.ensure_active(pipeline) {
            Ok(()) => self.source_mut(index).and_then(|source| source.assign(uri)),
            Err(e) => Err(e),
        };
        Self::outcome("assign_source", pipeline, result)
    }

    /// Start a pipeline from `Init` or `Stopped`
    pub async fn play(&mut self, index: PipelineIndex) -> Result<()> {
        let result = match self.ensure_active(index) {
            Ok(()) => self.start_pipeline(index),
            Err(e) => Err(e),
        };
        Self::outcome("play", index, result)
    }

    fn start_pipeline(&mut self, index: PipelineIndex) -> Result<()> {
        match index {
            PipelineIndex::Mix => self.mix.start(),
            PipelineIndex::Source(i) => {
                self.source_mut(i)?.start()?;
                self.mix.mixer().restart_source(i);
                Ok(())
            }
        }
    }

    /// Pause a running pipeline; pausing the mix pauses every running source too
    pub async fn pause(&mut self, index: PipelineIndex) -> Result<()> {
        let result = self.ensure_active(index).and_then(|_| match index {
            PipelineIndex::Mix => {
                let state = self.mix.state();
                if state != PipelineState::Running {
                    return Err(Error::invalid_state(index, state, "not running"));
                }
                for source in self.sources.iter_mut() {
                    if source.state() == PipelineState::Running {
                        if let Err(e) = source.pause() {
                            debug!("Cascade pause skipped {}: {}", source.index(), e);
                        }
                    }
                }
                self.mix.pause()
            }
            PipelineIndex::Source(i) => self.source_mut(i)?.pause(),
        });
        Self::outcome("pause", index, result)
    }

    /// Resume a paused pipeline; resuming the mix resumes every paused source too
    pub async fn resume(&mut self, index: PipelineIndex) -> Result<()> {
        let result = self.ensure_active(index).and_then(|_| match index {
            PipelineIndex::Mix => {
                let state = self.mix.state();
                if state != PipelineState::Paused {
                    return Err(Error::invalid_state(index, state, "not paused"));
                }
                for source in self.sources.iter_mut() {
                    if source.state() == PipelineState::Paused {
                        if let Err(e) = source.resume() {
                            debug!("Cascade resume skipped {}: {}", source.index(), e);
                        }
                    }
                }
                self.mix.resume()
            }
            PipelineIndex::Source(i) => self.source_mut(i)?.resume(),
        });
        Self::outcome("resume", index, result)
    }

    /// Stop and reset a running or paused pipeline
    ///
    /// Stopping the mix stops and resets the mix pipeline, then every source.
    pub async fn stop(&mut self, index: PipelineIndex) -> Result<()> {
        if let Err(e) = self.ensure_active(index) {
            return Self::outcome("stop", index, Err(e));
        }

        let state = match index {
            PipelineIndex::Mix => self.mix.state(),
            PipelineIndex::Source(i) => match self.source(i) {
                Ok(source) => source.state(),
                Err(e) => return Self::outcome("stop", index, Err(e)),
            },
        };
        if !state.can_stop() {
            return Self::outcome(
                "stop",
                index,
                Err(Error::invalid_state(index, state, "not running or paused")),
            );
        }

        match index {
            PipelineIndex::Mix => {
                self.mix.stop_and_reset().await;
                for source in self.sources.iter_mut() {
                    source.stop_and_reset().await;
                }
            }
            PipelineIndex::Source(i) => self.sources[i].stop_and_reset().await,
        }
        Self::outcome("stop", index, Ok(()))
    }

    /// Current lifecycle state of a pipeline
    pub fn get_state(&self, index: PipelineIndex) -> Result<PipelineState> {
        self.ensure_active(index)?;
        match index {
            PipelineIndex::Mix => Ok(self.mix.state()),
            PipelineIndex::Source(i) => Ok(self.source(i)?.state()),
        }
    }

    /// Format source `index` is currently decoded in, as last reported
    pub fn source_format(&self, index: usize) -> Result<SampleFormat> {
        self.ensure_active(PipelineIndex::Source(index))?;
        Ok(self.source(index)?.decoded_format())
    }

    /// Set the output volume; clamped to the transport range
    ///
    /// Takes effect on the next output chunk in any state.
    pub fn set_volume(&mut self, level: i32) -> Result<()> {
        self.ensure_active(PipelineIndex::Mix)?;
        let applied = self.volume.set(level);
        if applied != level {
            warn!("Volume {} clamped to {}", level, applied);
        }
        info!("Volume set to {}", applied);
        Ok(())
    }

    /// Last volume level set
    pub fn volume(&self) -> i32 {
        self.volume.get()
    }

    /// Process at most one event, waiting up to the configured poll timeout
    ///
    /// Returns `Err` only for faults that must end the control loop (a
    /// malformed format report) or when called after terminate.
    pub async fn handle_events(&mut self) -> Result<()> {
        self.ensure_active(PipelineIndex::Mix)?;

        let msg = self.bus.poll(self.poll_timeout).await;

        self.self_heal();

        match msg {
            Some(msg) => self.dispatch(msg).await,
            None => Ok(()),
        }
    }

    fn self_heal(&mut self) {
        if self.mix.state() != PipelineState::Init || self.sources.iter().all(|s| s.uri().is_none()) {
            return;
        }

        debug!("Mix pipeline idle with assigned sources, starting playback");
        for i in 0..self.sources.len() {
            if !self.sources[i].is_startable() {
                continue;
            }
            if let Err(e) = self.start_pipeline(PipelineIndex::Source(i)) {
                warn!("Could not start source {}: {}", i, e);
            }
        }
        if let Err(e) = self.mix.start() {
            warn!("Could not start mix pipeline: {}", e);
        }
    }

    async fn dispatch(&mut self, msg: EventMessage) -> Result<()> {
        if msg.source_kind == SourceKind::Peripheral {
            debug!("Peripheral report: {:?}", msg.command);
            return Ok(());
        }

        let PipelineIndex::Source(i) = msg.source.pipeline else {
            debug!("{} reported {:?}", msg.source, msg.command);
            return Ok(());
        };
        let Some(source) = self.sources.get(i) else {
            warn!("Report from unknown pipeline {}", msg.source);
            return Ok(());
        };
        if msg.run != source.run() {
            debug!(
                "Ignoring stale report from {} (run {}, current {})",
                msg.source,
                msg.run,
                source.run()
            );
            return Ok(());
        }

        if let Some(format) = msg.decoded_format() {
            if let Err(e) = self.mix.mixer().update_source_format(i, format) {
                error!("Rejected format report from {}: {}", msg.source, e);
                return Err(e);
            }
            self.sources[i].set_decoded_format(format);
            info!("{} format is {}", PipelineIndex::Source(i), format);
            return Ok(());
        }

        if let Some(completion) = msg.finished() {
            match completion {
                Completion::EndOfStream => info!("{} finished", msg.source),
                Completion::Failed(e) => warn!("{} finished with error: {}", msg.source, e),
            }
            if self.sources[i].state() == PipelineState::Finished {
                self.sources[i].stop_and_reset().await;
            }
            return Ok(());
        }

        debug!("{} reported {:?}", msg.source, msg.command);
        Ok(())
    }

    /// Stop everything and release all resources
    ///
    /// Calling it again is a logged no-op. Every later command fails with
    /// [`Error::InvalidState`].
    pub async fn terminate(&mut self) {
        if self.terminated {
            info!("Orchestrator already terminated");
            return;
        }

        for source in self.sources.iter_mut() {
            source.stop_and_reset().await;
        }
        self.mix.stop_and_reset().await;

        for source in &self.sources {
            self.bus.remove_listener(Listener::Pipeline(source.index()));
        }
        self.bus.remove_listener(Listener::Pipeline(PipelineIndex::Mix));
        self.bus.remove_listener(Listener::Peripherals);

        self.mix.close();
        self.bus.close();
        self.storage.stop();
        self.terminated = true;

        info!("Orchestrator terminated");
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

//! Source pipeline: reader → decoder → raw buffer writer
//!
//! Each run of a source pipeline executes on a blocking worker. The worker
//! opens the assigned URI through the storage peripheral, decodes it packet by
//! packet and writes samples into the pipeline's [`RawBuffer`], blocking while
//! the mixer has not caught up.
//!
//! A run ends in one of three ways:
//! - end of stream or a read/decode failure: the worker moves the pipeline to
//!   `Finished` and reports it
//! - a stop request: the worker halts silently; the control plane resets
//! - the pipeline is torn down at terminate (same as a stop)

use crate::audio::{RawBuffer, StreamDecoder};
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, EventReporter};
use crate::pipeline::element::{RunControl, StateCell};
use crate::storage::Storage;
use speaker_common::{
    Completion, ElementError, ElementId, ElementKind, ElementStatus, PipelineIndex, PipelineState,
    SampleFormat,
};
use std::fs::File;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reporters for the elements of one source pipeline
#[derive(Debug, Clone)]
struct SourceReporters {
    reader: EventReporter,
    decoder: EventReporter,
    raw: EventReporter,
}

/// One source pipeline
pub struct SourcePipeline {
    index: usize,
    state: Arc<StateCell>,
    uri: Option<String>,
    decoded_format: SampleFormat,
    default_format: SampleFormat,
    buffer: Arc<RawBuffer>,
    storage: Arc<dyn Storage>,
    reporters: SourceReporters,

    /// Incremented on every start
    run: u64,
    control: Option<Arc<RunControl>>,
    worker: Option<JoinHandle<()>>,
}

impl SourcePipeline {
    pub fn new(
        index: usize,
        buffer: Arc<RawBuffer>,
        default_format: SampleFormat,
        storage: Arc<dyn Storage>,
        bus: &EventBus,
    ) -> Self {
        let pipeline = PipelineIndex::Source(index);
        let reporters = SourceReporters {
            reader: bus.reporter(ElementId::new(pipeline, ElementKind::Reader)),
            decoder: bus.reporter(ElementId::new(pipeline, ElementKind::Decoder)),
            raw: bus.reporter(ElementId::new(pipeline, ElementKind::RawWriter)),
        };

        Self {
            index,
            state: Arc::new(StateCell::new(PipelineState::Init)),
            uri: None,
            decoded_format: default_format,
            default_format,
            buffer,
            storage,
            reporters,
            run: 0,
            control: None,
            worker: None,
        }
    }

    pub fn index(&self) -> PipelineIndex {
        PipelineIndex::Source(self.index)
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Current run generation
    pub fn run(&self) -> u64 {
        self.run
    }

    /// Last format reported by this pipeline's decoder (default until then)
    pub fn decoded_format(&self) -> SampleFormat {
        self.decoded_format
    }

    pub fn set_decoded_format(&mut self, format: SampleFormat) {
        self.decoded_format = format;
    }

    /// Raw buffer fed by this pipeline
    pub fn buffer(&self) -> &Arc<RawBuffer> {
        &self.buffer
    }

    /// True if the pipeline has a URI and can be started
    pub fn is_startable(&self) -> bool {
        self.uri.is_some() && self.state().can_start()
    }

    /// Set the source the next run will play
    pub fn assign(&mut self, uri: &str) -> Result<()> {
        let state = self.state();
        if matches!(state, PipelineState::Running | PipelineState::Paused) {
            return Err(Error::invalid_state(
                self.index(),
                state,
                "cannot change source while playing",
            ));
        }
        if uri.is_empty() {
            return Err(Error::Common(speaker_common::Error::InvalidInput(
                "source URI must not be empty".to_string(),
            )));
        }

        self.uri = Some(uri.to_string());
        debug!("{} assigned {}", self.index(), uri);
        Ok(())
    }

    /// Start a new run: `Init | Stopped` → `Running`
    pub fn start(&mut self) -> Result<()> {
        let Some(uri) = self.uri.clone() else {
            return Err(Error::invalid_state(self.index(), self.state(), "no source assigned"));
        };

        self.state
            .transition_from(|s| s.can_start(), PipelineState::Running)
            .map_err(|state| Error::invalid_state(self.index(), state, "already started"))?;

        self.run += 1;
        self.buffer.reset();

        let control = Arc::new(RunControl::new());
        let worker = SourceWorker {
            index: self.index,
            run: self.run,
            uri,
            storage: Arc::clone(&self.storage),
            buffer: Arc::clone(&self.buffer),
            state: Arc::clone(&self.state),
            control: Arc::clone(&control),
            reporters: self.reporters.clone(),
        };

        self.control = Some(control);
        self.worker = Some(tokio::task::spawn_blocking(move || worker.run()));

        info!("{} started (run {})", self.index(), self.run);
        Ok(())
    }

    /// `Running` → `Paused`
    ///
    /// The worker is signalled before the state changes, so a worker that sees
    /// `Paused` is always held by the pause signal.
    pub fn pause(&mut self) -> Result<()> {
        if let Some(control) = &self.control {
            control.pause();
        }

        if let Err(state) = self.state.transition(PipelineState::Running, PipelineState::Paused) {
            if state != PipelineState::Paused {
                if let Some(control) = &self.control {
                    control.resume();
                }
            }
            return Err(Error::invalid_state(self.index(), state, "not running"));
        }

        info!("{} paused", self.index());
        Ok(())
    }

    /// `Paused` → `Running`
    pub fn resume(&mut self) -> Result<()> {
        self.state
            .transition(PipelineState::Paused, PipelineState::Running)
            .map_err(|state| Error::invalid_state(self.index(), state, "not paused"))?;

        if let Some(control) = &self.control {
            control.resume();
        }
        info!("{} resumed", self.index());
        Ok(())
    }

    /// Halt the worker, drop buffered samples and return to `Init`
    ///
    /// Safe to call in any state; an idle pipeline is left as it is apart from
    /// the format reset. Resetting a run retires its generation, so reports it
    /// queued before halting are treated as stale.
    pub async fn stop_and_reset(&mut self) {
        let previous = self.state();

        if let Some(control) = self.control.take() {
            // Stopped first so a worker racing to Finished loses
            let _ = self.state.transition_from(
                |s| matches!(s, PipelineState::Running | PipelineState::Paused),
                PipelineState::Stopped,
            );
            control.request_stop();
            self.buffer.wake();
            self.run += 1;
        }

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("{} worker failed: {}", self.index(), e);
            }
        }

        self.buffer.reset();
        self.decoded_format = self.default_format;
        self.state.set(PipelineState::Init);

        if previous != PipelineState::Init {
            info!("{} reset from {}", self.index(), previous);
        }
    }
}

/// Everything one run's worker needs
struct SourceWorker {
    index: usize,
    run: u64,
    uri: String,
    storage: Arc<dyn Storage>,
    buffer: Arc<RawBuffer>,
    state: Arc<StateCell>,
    control: Arc<RunControl>,
    reporters: SourceReporters,
}

/// How the decode loop ended
enum Outcome {
    Completed(Completion, ElementKind),
    Halted,
}

impl SourceWorker {
    fn pipeline(&self) -> PipelineIndex {
        PipelineIndex::Source(self.index)
    }

    fn run(self) {
        self.reporters.decoder.status(self.run, ElementStatus::Running);

        match self.decode_loop() {
            Outcome::Completed(completion, kind) => self.finish(completion, kind),
            Outcome::Halted => {
                debug!("{} run {} halted by stop", self.pipeline(), self.run);
                self.reporters.raw.status(self.run, ElementStatus::Stopped);
            }
        }
    }

    fn open(&self) -> std::result::Result<StreamDecoder, (ElementError, ElementKind)> {
        let path = self
            .storage
            .resolve(&self.uri)
            .map_err(|e| (ElementError::Io(e.to_string()), ElementKind::Reader))?;

        let file = File::open(&path).map_err(|e| {
            (
                ElementError::Io(format!("{}: {}", path.display(), e)),
                ElementKind::Reader,
            )
        })?;

        let extension = path.extension().and_then(|e| e.to_str());
        StreamDecoder::from_file(file, extension).map_err(|e| match e {
            Error::Io(io) => (ElementError::Io(io.to_string()), ElementKind::Reader),
            other => (ElementError::Decode(other.to_string()), ElementKind::Decoder),
        })
    }

    fn decode_loop(&self) -> Outcome {
        let mut decoder = match self.open() {
            Ok(decoder) => decoder,
            Err((error, kind)) => {
                return Outcome::Completed(Completion::Failed(error), kind);
            }
        };

        let mut reported: Option<SampleFormat> = None;

        loop {
            if !self.control.wait_while_paused() {
                return Outcome::Halted;
            }

            let chunk = match decoder.next_chunk() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    return Outcome::Completed(Completion::EndOfStream, ElementKind::Decoder);
                }
                Err(Error::Io(e)) => {
                    return Outcome::Completed(
                        Completion::Failed(ElementError::Io(e.to_string())),
                        ElementKind::Reader,
                    );
                }
                Err(e) => {
                    return Outcome::Completed(
                        Completion::Failed(ElementError::Decode(e.to_string())),
                        ElementKind::Decoder,
                    );
                }
            };

            if reported != Some(chunk.format) {
                debug!("{} decoding {}", self.pipeline(), chunk.format);
                self.reporters.decoder.music_info(self.run, chunk.format);
                reported = Some(chunk.format);
            }

            let control = &self.control;
            if !self.buffer.write_blocking(&chunk.samples, || control.stop_requested()) {
                return Outcome::Halted;
            }
        }
    }

    fn finish(&self, completion: Completion, kind: ElementKind) {
        // A paused run only finishes once resumed; a stop always wins
        loop {
            if !self.control.wait_while_paused() {
                self.reporters.raw.status(self.run, ElementStatus::Stopped);
                return;
            }

            match self.state.transition(PipelineState::Running, PipelineState::Finished) {
                Ok(()) => break,
                Err(PipelineState::Paused) => std::thread::yield_now(),
                Err(state) => {
                    debug!(
                        "{} run {} ended while {}, not reporting",
                        self.pipeline(),
                        self.run,
                        state
                    );
                    return;
                }
            }
        }

        match &completion {
            Completion::EndOfStream => info!("{} finished: {}", self.pipeline(), self.uri),
            Completion::Failed(e) => warn!("{} failed on {}: {}", self.pipeline(), self.uri, e),
        }

        let reporter = match kind {
            ElementKind::Reader => &self.reporters.reader,
            ElementKind::RawWriter => &self.reporters.raw,
            _ => &self.reporters.decoder,
        };
        reporter.status(self.run, ElementStatus::Finished(completion));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStorage;
    use speaker_common::EventMessage;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames * channels as usize {
            writer.write_sample(((i % 50) as i16) * 200).unwrap();
        }
        writer.finalize().unwrap();
    }

    struct Fixture {
        _dir: TempDir,
        bus: EventBus,
        pipeline: SourcePipeline,
    }

    fn fixture(capacity: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        write_wav(&dir.path().join("short.wav"), 8000, 1, 400);
        write_wav(&dir.path().join("long.wav"), 8000, 2, 80_000);

        let storage = Arc::new(FsStorage::new("/spiffs", dir.path()));
        storage.start().unwrap();

        let bus = EventBus::new();
        let pipeline = SourcePipeline::new(
            0,
            Arc::new(RawBuffer::new(capacity)),
            SampleFormat::DEFAULT,
            storage,
            &bus,
        );
        Fixture {
            _dir: dir,
            bus,
            pipeline,
        }
    }

    async fn next_finished(bus: &mut EventBus) -> EventMessage {
        loop {
            let msg = bus.poll(Duration::from_secs(5)).await.expect("no event");
            if msg.finished().is_some() {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_start_requires_uri() {
        let mut f = fixture(1024);
        let err = f.pipeline.start().unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(f.pipeline.state(), PipelineState::Init);
    }

    #[tokio::test]
    async fn test_short_file_finishes_with_format_report() {
        let mut f = fixture(8192);
        f.pipeline.assign("/spiffs/short.wav").unwrap();
        f.pipeline.start().unwrap();

        let mut format = None;
        loop {
            let msg = f.bus.poll(Duration::from_secs(5)).await.expect("no event");
            if let Some(fmt) = msg.decoded_format() {
                format = Some(fmt);
            }
            if let Some(completion) = msg.finished() {
                assert_eq!(completion, &Completion::EndOfStream);
                assert_eq!(msg.run, 1);
                break;
            }
        }

        assert_eq!(format, Some(SampleFormat::new(8000, 1, 16)));
        assert_eq!(f.pipeline.state(), PipelineState::Finished);
        assert_eq!(f.pipeline.buffer().available(), 400);

        f.pipeline.stop_and_reset().await;
        assert_eq!(f.pipeline.state(), PipelineState::Init);
        assert_eq!(f.pipeline.buffer().available(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_finishes_with_io_error() {
        let mut f = fixture(1024);
        f.pipeline.assign("/spiffs/absent.mp3").unwrap();
        f.pipeline.start().unwrap();

        let msg = next_finished(&mut f.bus).await;
        assert_eq!(msg.source.kind, ElementKind::Reader);
        assert!(matches!(
            msg.finished(),
            Some(Completion::Failed(ElementError::Io(_)))
        ));
        assert_eq!(f.pipeline.state(), PipelineState::Finished);
    }

    #[tokio::test]
    async fn test_pause_resume_and_stop_blocked_writer() {
        // Small buffer keeps the worker blocked on backpressure
        let mut f = fixture(256);
        f.pipeline.assign("/spiffs/long.wav").unwrap();
        f.pipeline.start().unwrap();

        assert!(f.pipeline.assign("/spiffs/short.wav").is_err());
        assert!(f.pipeline.resume().is_err());

        f.pipeline.pause().unwrap();
        assert_eq!(f.pipeline.state(), PipelineState::Paused);
        assert!(f.pipeline.pause().is_err());

        f.pipeline.resume().unwrap();
        assert_eq!(f.pipeline.state(), PipelineState::Running);

        tokio::time::timeout(Duration::from_secs(2), f.pipeline.stop_and_reset())
            .await
            .expect("stop did not complete");
        assert_eq!(f.pipeline.state(), PipelineState::Init);
        assert_eq!(f.pipeline.decoded_format(), SampleFormat::DEFAULT);

        // The reset retired run 1, the restart opens run 3
        f.pipeline.start().unwrap();
        assert_eq!(f.pipeline.run(), 3);
        f.pipeline.stop_and_reset().await;
        assert_eq!(f.pipeline.run(), 4);
    }

    /// Drain the bus; true if any report was a completion
    async fn saw_finished(bus: &mut EventBus, quiet: Duration) -> bool {
        let mut finished = false;
        while let Some(msg) = bus.poll(quiet).await {
            finished |= msg.finished().is_some();
        }
        finished
    }

    /// Worker for the pipeline's current run, driven directly by the test
    fn bare_worker(f: &Fixture, control: &Arc<RunControl>) -> SourceWorker {
        SourceWorker {
            index: 0,
            run: 1,
            uri: "/spiffs/short.wav".to_string(),
            storage: Arc::clone(&f.pipeline.storage),
            buffer: Arc::clone(&f.pipeline.buffer),
            state: Arc::clone(&f.pipeline.state),
            control: Arc::clone(control),
            reporters: f.pipeline.reporters.clone(),
        }
    }

    /// Start the short file on a buffer too small for it and wait for the
    /// worker to block on backpressure, then pause it
    async fn paused_before_end(f: &mut Fixture) {
        f.pipeline.assign("/spiffs/short.wav").unwrap();
        f.pipeline.start().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while f.pipeline.buffer().available() < 256 {
            assert!(tokio::time::Instant::now() < deadline, "worker never filled the buffer");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.pipeline.pause().unwrap();

        // Let the worker write the rest and reach the end of the stream
        let mut out = [0.0f32; 64];
        let mut drained = 0;
        while drained < 400 {
            assert!(tokio::time::Instant::now() < deadline, "worker never wrote the tail");
            let read = f.pipeline.buffer().read(&mut out);
            if read == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            drained += read;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_of_stream_held_while_paused() {
        let mut f = fixture(256);
        paused_before_end(&mut f).await;

        assert!(!saw_finished(&mut f.bus, Duration::from_millis(150)).await);
        assert_eq!(f.pipeline.state(), PipelineState::Paused);

        f.pipeline.resume().unwrap();
        let msg = next_finished(&mut f.bus).await;
        assert_eq!(msg.finished(), Some(&Completion::EndOfStream));
        assert_eq!(f.pipeline.state(), PipelineState::Finished);

        f.pipeline.stop_and_reset().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_while_paused_at_end_of_stream() {
        let mut f = fixture(256);
        paused_before_end(&mut f).await;

        tokio::time::timeout(Duration::from_secs(2), f.pipeline.stop_and_reset())
            .await
            .expect("stop did not complete");
        assert_eq!(f.pipeline.state(), PipelineState::Init);
        assert!(!saw_finished(&mut f.bus, Duration::from_millis(100)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_landing_before_signal_keeps_completion() {
        let mut f = fixture(1024);
        let control = Arc::new(RunControl::new());
        f.pipeline.state.set(PipelineState::Running);
        let worker = bare_worker(&f, &control);

        // State already Paused, pause signal not delivered yet
        f.pipeline
            .state
            .transition(PipelineState::Running, PipelineState::Paused)
            .unwrap();
        let handle = std::thread::spawn(move || {
            worker.finish(Completion::EndOfStream, ElementKind::Decoder)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.pause();

        assert!(!saw_finished(&mut f.bus, Duration::from_millis(100)).await);
        assert_eq!(f.pipeline.state(), PipelineState::Paused);

        f.pipeline
            .state
            .transition(PipelineState::Paused, PipelineState::Running)
            .unwrap();
        control.resume();
        handle.join().unwrap();

        assert_eq!(f.pipeline.state(), PipelineState::Finished);
        let msg = next_finished(&mut f.bus).await;
        assert_eq!(msg.run, 1);
        assert_eq!(msg.source.kind, ElementKind::Decoder);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_beats_paused_completion() {
        let mut f = fixture(1024);
        let control = Arc::new(RunControl::new());
        f.pipeline.state.set(PipelineState::Paused);
        control.pause();
        let worker = bare_worker(&f, &control);

        let handle = std::thread::spawn(move || {
            worker.finish(Completion::EndOfStream, ElementKind::Decoder)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.pipeline
            .state
            .transition_from(
                |s| matches!(s, PipelineState::Running | PipelineState::Paused),
                PipelineState::Stopped,
            )
            .unwrap();
        control.request_stop();
        handle.join().unwrap();

        assert_eq!(f.pipeline.state(), PipelineState::Stopped);
        let msg = f.bus.poll(Duration::from_secs(1)).await.expect("no halt report");
        assert_eq!(msg.source.kind, ElementKind::RawWriter);
        assert!(msg.finished().is_none());
        assert!(!saw_finished(&mut f.bus, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_pause_twice_keeps_worker_held() {
        let mut f = fixture(256);
        f.pipeline.assign("/spiffs/long.wav").unwrap();
        f.pipeline.start().unwrap();

        f.pipeline.pause().unwrap();
        assert!(f.pipeline.pause().is_err());
        assert!(f.pipeline.control.as_ref().unwrap().is_paused());

        f.pipeline.stop_and_reset().await;
    }

    #[tokio::test]
    async fn test_stop_and_reset_is_idempotent() {
        let mut f = fixture(1024);
        f.pipeline.stop_and_reset().await;
        f.pipeline.stop_and_reset().await;
        assert_eq!(f.pipeline.state(), PipelineState::Init);
    }
}

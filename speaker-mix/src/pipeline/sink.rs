//! Output sink: applies the volume gain and feeds the transport

use crate::audio::transport::OutputTransport;
use speaker_common::config::{VOLUME_MAX_DB, VOLUME_MIN_DB};
use speaker_common::format::db_to_linear;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace};

use super::mix::MixCommand;

/// Wait before retrying a write the transport could not fully accept
const OUTPUT_RETRY: Duration = Duration::from_millis(5);

/// Volume register shared between the control plane and the sink task
#[derive(Debug)]
pub struct VolumeControl {
    level_db: AtomicI32,
}

impl VolumeControl {
    pub fn new(level_db: i32) -> Self {
        Self {
            level_db: AtomicI32::new(clamp_volume(level_db)),
        }
    }

    /// Set the level; returns the clamped value applied
    pub fn set(&self, level_db: i32) -> i32 {
        let level = clamp_volume(level_db);
        self.level_db.store(level, Ordering::Release);
        level
    }

    pub fn get(&self) -> i32 {
        self.level_db.load(Ordering::Acquire)
    }

    /// Linear gain for the current level
    pub fn linear(&self) -> f32 {
        db_to_linear(self.get() as f32)
    }
}

/// Clamp a volume level to the transport range
pub fn clamp_volume(level_db: i32) -> i32 {
    level_db.clamp(VOLUME_MIN_DB, VOLUME_MAX_DB)
}

/// Sink task body
///
/// Runs until the mixer side of `chunks` closes or a stop is commanded, then
/// hands the transport back.
pub(crate) async fn run_sink(
    mut transport: Box<dyn OutputTransport>,
    mut chunks: mpsc::Receiver<Vec<f32>>,
    volume: Arc<VolumeControl>,
    control: watch::Receiver<MixCommand>,
) -> Box<dyn OutputTransport> {
    debug!("Output sink started");

    while let Some(mut chunk) = chunks.recv().await {
        let gain = volume.linear();
        if gain != 1.0 {
            for sample in chunk.iter_mut() {
                *sample *= gain;
            }
        }

        let mut offset = 0;
        while offset < chunk.len() {
            if *control.borrow() == MixCommand::Stop {
                debug!("Output sink dropping chunk on stop");
                break;
            }
            match transport.write(&chunk[offset..]) {
                Ok(0) => {
                    trace!("Transport full, retrying");
                    tokio::time::sleep(OUTPUT_RETRY).await;
                }
                Ok(written) => offset += written,
                Err(e) => {
                    error!("Output write failed, dropping chunk: {}", e);
                    break;
                }
            }
        }
    }

    debug!("Output sink stopped");
    transport
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::transport::CaptureTransport;

    #[test]
    fn test_volume_clamped_to_transport_range() {
        let volume = VolumeControl::new(0);
        assert_eq!(volume.linear(), 1.0);

        assert_eq!(volume.set(-25), -25);
        assert!((volume.linear() - db_to_linear(-25.0)).abs() < 1e-6);

        assert_eq!(volume.set(-100), VOLUME_MIN_DB);
        assert_eq!(volume.set(100), VOLUME_MAX_DB);
        assert_eq!(VolumeControl::new(200).get(), VOLUME_MAX_DB);
    }

    #[tokio::test]
    async fn test_sink_applies_gain_and_returns_transport() {
        let capture = CaptureTransport::new();
        let handle = capture.handle();
        let volume = Arc::new(VolumeControl::new(-20));
        let (_control_tx, control_rx) = watch::channel(MixCommand::Run);
        let (tx, rx) = mpsc::channel(4);

        let sink = tokio::spawn(run_sink(Box::new(capture), rx, Arc::clone(&volume), control_rx));

        tx.send(vec![1.0; 8]).await.unwrap();
        drop(tx);

        let _transport = sink.await.unwrap();
        assert_eq!(handle.len(), 8);
        assert!((handle.tail_peak(8) - 0.1).abs() < 1e-4);
    }
}

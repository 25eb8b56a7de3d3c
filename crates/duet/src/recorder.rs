//! IQ recording to WAV
//!
//! I goes to the left channel and Q to the right, as 16-bit PCM at the host
//! sample rate.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tracing::info;
use uuid::Uuid;

use crate::sdk::IqSample;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("failed to create record directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("WAV error on {path}: {source}")]
    Wav {
        path: PathBuf,
        source: hound::Error,
    },

    #[error("invalid recording sample rate {0}")]
    InvalidRate(f64),
}

pub struct IqRecorder {
    path: PathBuf,
    writer: hound::WavWriter<BufWriter<File>>,
    samples: u64,
}

impl IqRecorder {
    /// Start a new recording in `dir`, named after the instance and the time.
    pub fn create(dir: &Path, instance: Uuid, sample_rate: f64) -> Result<Self, RecorderError> {
        if !(sample_rate >= 1.0 && sample_rate <= f64::from(u32::MAX)) {
            return Err(RecorderError::InvalidRate(sample_rate));
        }
        std::fs::create_dir_all(dir).map_err(|source| RecorderError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let id = instance.simple().to_string();
        let stamp = chrono::Local::now().format("%Y-%m-%dT%H_%M_%S%.3f");
        let path = dir.join(format!("duet-{}-{}.wav", &id[..8], stamp));

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: sample_rate.round() as u32,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec).map_err(|source| RecorderError::Wav {
            path: path.clone(),
            source,
        })?;
        info!("recording to {}", path.display());
        Ok(Self {
            path,
            writer,
            samples: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn write(&mut self, block: &[IqSample]) -> Result<(), RecorderError> {
        for s in block {
            self.writer
                .write_sample(s.i)
                .and_then(|_| self.writer.write_sample(s.q))
                .map_err(|source| RecorderError::Wav {
                    path: self.path.clone(),
                    source,
                })?;
        }
        self.samples += block.len() as u64;
        Ok(())
    }

    /// Flush the header and close the file.
    pub fn finalize(self) -> Result<PathBuf, RecorderError> {
        let Self {
            path,
            writer,
            samples,
        } = self;
        writer.finalize().map_err(|source| RecorderError::Wav {
            path: path.clone(),
            source,
        })?;
        info!("recording finished: {} ({} samples)", path.display(), samples);
        Ok(path)
    }
}

impl std::fmt::Debug for IqRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IqRecorder")
            .field("path", &self.path)
            .field("samples", &self.samples)
            .finish()
    }
}

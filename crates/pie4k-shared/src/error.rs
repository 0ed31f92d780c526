//! Error kinds shared across the pipeline (§7 of the design).
//!
//! Only [`Pie4kError::Configuration`] and [`Pie4kError::VramMeasurement`]
//! are fatal for the whole process; everything else is recovered at the
//! layer that produced it (see each variant's doc comment).

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Pie4kError>;

/// Top-level error kind. Most call sites only care whether a variant is
/// fatal (`Configuration`, `VramMeasurement`) or recoverable (everything
/// else); see §7 for the full propagation policy.
#[derive(Debug, thiserror::Error)]
pub enum Pie4kError {
    /// Unreadable config, invalid enum value, or missing model files.
    /// Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Bad signature/version in a key/index or archive file, or a table
    /// extent that overruns the file. Fatal for the affected archive only.
    #[error("index integrity error in {path}: {reason}")]
    IndexIntegrity { path: PathBuf, reason: String },

    /// `(name, type)` absent from the resource index, or its archive
    /// could not be resolved on disk.
    #[error("resource not found: {name} (type {type_code:#06x})")]
    ResourceNotFound { name: String, type_code: u16 },

    /// Seek/read failure on an archive or cache file.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// zlib failure or a block size mismatch mid-stream. The partial
    /// cache file is not written on failure.
    #[error("decompression error: {0}")]
    Compression(String),

    /// A scheduled task's thunk returned an error. Captured per task; the
    /// scheduler still records a failed profile sample.
    #[error("task '{operation_type}' failed: {reason}")]
    TaskFailure {
        operation_type: String,
        reason: String,
    },

    /// Model load failure (GPU then CPU), image read/write failure, or
    /// tile inference failure.
    #[error("upscale error: {0}")]
    Upscale(String),

    /// Baseline VRAM reported zero, or a model load produced no
    /// measurable VRAM delta. Fatal for the owning service instance.
    #[error("VRAM measurement error: {0}")]
    VramMeasurement(String),
}

impl Pie4kError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Pie4kError::Io {
            path: path.into(),
            source,
        }
    }
}

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Scf,
    Cholesky,
    Restore,
    Persist,
    BasisRotation,
    CholeskyTransform,
    Reconstruction,
    Export,
    Solve,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Scf => "scf",
            Stage::Cholesky => "cholesky",
            Stage::Restore => "restore",
            Stage::Persist => "persist",
            Stage::BasisRotation => "basis rotation",
            Stage::CholeskyTransform => "cholesky transform",
            Stage::Reconstruction => "reconstruction",
            Stage::Export => "export",
            Stage::Solve => "solve",
        };
        f.write_str(name)
    }
}

/// Error type of the pipeline.
///
/// Collectively detected errors are handed to every rank of the process
/// group, so the type is `Clone` and travels through the group transport.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum Error {
    /// Invalid tiling/partition or malformed options.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Symbolic operation violating index or allocation rules.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Allocation exceeds the memory available to a rank.
    #[error("cannot allocate {tensor}: rank {rank} needs {requested} bytes but only {available} are available")]
    Resource { tensor: String, rank: usize, requested: usize, available: usize },

    /// Checkpoint file shape mismatch or corrupt header.
    #[error("format error in {path:?}: {reason}")]
    Format { path: PathBuf, reason: String },

    /// Non-finite value produced by a contraction.
    #[error("non-finite value in tensor {tensor} at tile {tile:?}")]
    Numerical { tensor: String, tile: Vec<usize> },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        #[serde(with = "wire_io")]
        source: Arc<std::io::Error>,
    },

    /// A rank deviated from the collective call order.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Another rank failed and the group was torn down.
    #[error("process group aborted by rank {rank}: {reason}")]
    Aborted { rank: usize, reason: String },

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// I/O errors cross the transport as OS error code and message.
mod wire_io {
    use std::io;
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct WireIo {
        os_code: Option<i32>,
        message: String,
    }

    pub fn serialize<S: Serializer>(err: &Arc<io::Error>, serializer: S) -> Result<S::Ok, S::Error> {
        WireIo { os_code: err.raw_os_error(), message: err.to_string() }.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<io::Error>, D::Error> {
        let wire = WireIo::deserialize(deserializer)?;
        let err = match wire.os_code {
            Some(code) => io::Error::from_raw_os_error(code),
            None => io::Error::other(wire.message),
        };
        Ok(Arc::new(err))
    }
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io { path: path.as_ref().to_path_buf(), source: Arc::new(source) }
    }

    pub fn format(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Error::Format { path: path.as_ref().to_path_buf(), reason: reason.into() }
    }

    /// Stage the error was raised in, if it was tagged with one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Innermost error, with stage tags peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Attach a pipeline stage to an error.
pub trait StageExt<T> {
    fn in_stage(self, stage: Stage) -> Result<T>;
}

impl<T> StageExt<T> for Result<T> {
    fn in_stage(self, stage: Stage) -> Result<T> {
        self.map_err(|err| match err {
            // keep the innermost stage, it names the failing step
            Error::Stage { .. } | Error::Aborted { .. } => err,
            err => Error::Stage { stage, source: Box::new(err) },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_is_attached_once() {
        let err: Result<()> = Err(Error::Numerical { tensor: "full_v2".into(), tile: vec![0, 1, 0, 1] });
        let err = err.in_stage(Stage::Reconstruction).in_stage(Stage::Export).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Reconstruction));
        assert!(matches!(err.root(), Error::Numerical { .. }));
        let msg = err.to_string();
        assert!(msg.contains("reconstruction"));
        assert!(msg.contains("full_v2"));
        assert!(msg.contains("[0, 1, 0, 1]"));
    }

    #[test]
    fn test_io_error_keeps_path() {
        let err = Error::io("/nonexistent/file.cholv2", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.to_string().contains("file.cholv2"));
    }

    #[test]
    fn test_staged_error_crosses_transport() {
        let err = Err::<(), _>(Error::io("h2o.f1_mo", std::io::Error::other("disk full")))
            .in_stage(Stage::Persist)
            .unwrap_err();
        let received: Error = bincode::deserialize(&bincode::serialize(&err).unwrap()).unwrap();
        assert_eq!(received.stage(), Some(Stage::Persist));
        assert_eq!(received.to_string(), err.to_string());
    }
}

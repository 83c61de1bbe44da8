use thiserror::Error;

/// Which endpoint of a proposed range failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Start,
    End,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Start => write!(f, "start"),
            Endpoint::End => write!(f, "end"),
        }
    }
}

/// Error taxonomy surfaced by the disklabel engine (see spec §7).
///
/// The core never retries internally; retry-on-error prompting for the
/// retryable kinds (Path/NotOpen/Module/Geometry/...) is a caller concern.
#[derive(Debug, Error)]
pub enum DiskforgeError {
    #[error("allocation failed")]
    NoMem,

    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not open device path: {0}")]
    Path(String),

    #[error("device is not open")]
    NotOpen,

    #[error("no backend module could handle this device")]
    Module,

    #[error("geometry rejected at {endpoint}: {reason}")]
    Geometry { endpoint: Endpoint, reason: String },

    #[error("geometry length must be positive, got {0}")]
    GeometryLength(i64),

    #[error("invalid geometry handle")]
    GeometryPointer,

    #[error("partition number {0} is out of range or empty")]
    PartitionNumber(u32),

    #[error("unknown partition type: {0}")]
    PartitionType(String),

    #[error("partition operation rejected: {0}")]
    Partition(String),

    #[error("disklabel has no free partition slot")]
    DisklabelFull,

    #[error("unknown disklabel system: {0}")]
    DisklabelSystem(String),

    #[error("unknown parameter: {0}")]
    Parameter(String),

    #[error("parameter payload size mismatch: expected {expected}, got {got}")]
    ParameterSize { expected: usize, got: usize },

    #[error("cylinder count undetermined")]
    Cylinders,

    #[error("head count undetermined")]
    Heads,

    #[error("sectors-per-track undetermined")]
    Sectors,

    #[error("sector size undetermined")]
    SectorSize,

    #[error("operation not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, DiskforgeError>;

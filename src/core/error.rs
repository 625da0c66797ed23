use thiserror::Error;

/// Named error kinds from the component error table. Infrastructure errors
/// (`CacheError`) are swallowed with a best-effort fallback at the call
/// site; the rest propagate to the caller as one of these variants so UI
/// code can match on `.kind()` rather than parsing a message string.
#[derive(Error, Debug)]
pub enum SamError {
    #[error("GPU unavailable: {0}")]
    GpuUnavailable(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("aborted")]
    Aborted,

    #[error("image {image_id} was not encoded before decode")]
    NotEncoded { image_id: String },

    #[error("initialization failed: {0}")]
    InitError(String),

    #[error("model I/O error: {0}")]
    ModelIoError(String),

    #[error("segmentation failed: {0}")]
    SegmentError(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

impl SamError {
    pub fn kind(&self) -> &'static str {
        match self {
            SamError::GpuUnavailable(_) => "GpuUnavailable",
            SamError::NetworkError(_) => "NetworkError",
            SamError::CacheError(_) => "CacheError",
            SamError::Aborted => "Aborted",
            SamError::NotEncoded { .. } => "NotEncoded",
            SamError::InitError(_) => "InitError",
            SamError::ModelIoError(_) => "ModelIoError",
            SamError::SegmentError(_) => "SegmentError",
            SamError::InvalidArguments(_) => "InvalidArguments",
        }
    }
}

pub type Result<T> = std::result::Result<T, SamError>;

use thiserror::Error;

/// The playlist loop was torn down while a request was in flight.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("muxer cancelled")]
pub struct Cancelled;

#[derive(Debug, Error)]
pub enum DtsExtractError {
    #[error("{0}")]
    Extract(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreateInitError {
    #[error("parse sps: need at least 4 bytes, got {0}")]
    ParseSps(usize),
}

#[derive(Debug, Error)]
pub enum GeneratePartError {
    #[error("convert {0}: {1}")]
    TryFromInt(&'static str, std::num::TryFromIntError),
}

#[derive(Debug, Error)]
pub enum WriteFrameError {
    #[error("maximum segment size reached")]
    MaximumSegmentSize,

    #[error("dts extract: {0}")]
    DtsExtract(#[from] DtsExtractError),

    #[error("generate part: {0}")]
    GeneratePart(#[from] GeneratePartError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

//! Low-Latency HLS muxer: packages H.264/AAC access units into fMP4
//! segments and partial segments and answers LL-HLS file requests.

pub mod error;
pub mod http;
mod init;
pub mod mp4;
mod muxer;
mod part;
mod playlist;
mod segment;
mod segmenter;
pub mod types;

pub use http::{FileBody, FileQuery, FileResponse, HlsService};
pub use muxer::{HlsMuxer, HlsWriter, MuxerConfig};
pub use part::PartFinalized;
pub use segment::SegmentFinalized;
pub use types::{
    AudioSample, DtsExtractor, DtsExtractorFactory, PassthroughDtsExtractor, StreamInfo,
    StreamInfoProvider, VideoSample,
};

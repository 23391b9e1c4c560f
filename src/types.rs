use crate::error::DtsExtractError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// 14496-12_2015 8.3.2.3
/// Track IDs are never re-used and cannot be zero.
pub const VIDEO_TRACK_ID: u32 = 1;

pub const VIDEO_TIMESCALE: u32 = 90_000;
pub const MOVIE_TIMESCALE: u32 = 1_000;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Segment IDs start at 7 so the playlist can pad the initial window
/// with valid prior entries. Some client stacks fail without history.
pub(crate) const FIRST_SEGMENT_ID: u64 = 7;

/// Convert a nanosecond count into `timescale` ticks. Split form so
/// intermediate products stay within `i64` for any realistic uptime.
pub fn nanos_to_timescale(v: i64, timescale: u32) -> i64 {
    let timescale = i64::from(timescale);
    (v / NANOS_PER_SECOND) * timescale + (v % NANOS_PER_SECOND) * timescale / NANOS_PER_SECOND
}

/// Inverse of [`nanos_to_timescale`], accurate to one tick.
pub fn timescale_to_nanos(v: i64, timescale: u32) -> i64 {
    let timescale = i64::from(timescale);
    (v / timescale) * NANOS_PER_SECOND + (v % timescale) * NANOS_PER_SECOND / timescale
}

pub(crate) fn unix_nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or_default()
}

/// Current track parameters of the ingest stream.
///
/// Owned and updated by the upstream parser; the muxer re-reads it through a
/// [`StreamInfoProvider`] whenever it needs the SPS/PPS or audio config.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub video_track_exist: bool,
    pub video_sps: Bytes,
    pub video_pps: Bytes,
    /// Pixel dimensions parsed from the SPS.
    pub video_width: u16,
    pub video_height: u16,

    pub audio_track_exist: bool,
    /// Raw MPEG-4 AudioSpecificConfig.
    pub audio_track_config: Bytes,
    pub audio_channel_count: u16,
    /// Samples per second.
    pub audio_clock_rate: u32,
    pub audio_type: u8,
}

/// Thread-safe accessor for the live [`StreamInfo`].
pub trait StreamInfoProvider: Send + Sync {
    fn stream_info(&self) -> Arc<StreamInfo>;
}

/// Derives decode timestamps for incoming access units.
///
/// Reordered streams need slice-header inspection to recover the decode
/// order, which belongs to the H.264 parser feeding this muxer. The
/// extractor is handed every AVCC-framed sample together with its PTS and
/// must return a DTS on the same clock.
pub trait DtsExtractor: Send {
    fn extract(&mut self, avcc: &[u8], pts: i64) -> Result<i64, DtsExtractError>;
}

pub type DtsExtractorFactory = Box<dyn Fn() -> Box<dyn DtsExtractor> + Send>;

/// Extractor for streams without frame reordering, where decode order
/// equals presentation order.
pub struct PassthroughDtsExtractor;

impl DtsExtractor for PassthroughDtsExtractor {
    fn extract(&mut self, _avcc: &[u8], pts: i64) -> Result<i64, DtsExtractError> {
        Ok(pts)
    }
}

/// Video access unit in AVCC framing. Timestamps are unix nanoseconds.
/// `next_dts` is filled in when the following sample arrives.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoSample {
    pub pts: i64,
    pub dts: i64,
    pub avcc: Bytes,
    pub idr_present: bool,
    pub next_dts: i64,
}

impl VideoSample {
    pub fn duration(&self) -> i64 {
        self.next_dts - self.dts
    }
}

/// Single AAC frame. `next_pts` is filled in when the following sample
/// arrives.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioSample {
    pub pts: i64,
    pub au: Bytes,
    pub next_pts: i64,
}

impl AudioSample {
    pub fn duration(&self) -> i64 {
        self.next_pts - self.pts
    }
}

pub(crate) struct IdCounter {
    next: u64,
}

impl IdCounter {
    pub(crate) fn new(start: u64) -> Self {
        Self { next: start }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

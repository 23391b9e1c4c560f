//! Muxer facade composing the segmenter and the playlist controller.

use crate::error::{Cancelled, CreateInitError, WriteFrameError};
use crate::http::{self, FileQuery, FileResponse};
use crate::init::generate_init;
use crate::playlist::Playlist;
use crate::segment::SegmentFinalized;
use crate::segmenter::Segmenter;
use crate::types::{DtsExtractorFactory, StreamInfo, StreamInfoProvider};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    /// Number of entries kept in the live window.
    pub segment_count: usize,

    /// Minimum duration of a segment.
    pub segment_duration: Duration,

    /// Minimum duration of a partial segment.
    pub part_duration: Duration,

    /// Maximum byte size of a segment.
    pub segment_max_size: u64,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            segment_count: 7,
            segment_duration: Duration::from_secs(1),
            part_duration: Duration::from_millis(200),
            segment_max_size: 50 * 1024 * 1024,
        }
    }
}

struct InitCache {
    sps: Bytes,
    pps: Bytes,
    content: Bytes,
}

/// Read side of the muxer: file lookups and segment subscriptions.
pub struct HlsMuxer {
    playlist: Arc<Playlist>,
    info: Arc<dyn StreamInfoProvider>,
    init_cache: Mutex<Option<InitCache>>,
}

impl HlsMuxer {
    /// Spawn the playlist loop and return the shared read side together
    /// with the single-owner write side. Dropping the writer tears the
    /// muxer down; cancelling `token` does too.
    pub fn new(
        token: &CancellationToken,
        config: &MuxerConfig,
        info: Arc<dyn StreamInfoProvider>,
        make_dts_extractor: DtsExtractorFactory,
    ) -> (Arc<Self>, HlsWriter) {
        let child = token.child_token();
        let playlist = Playlist::new(child.clone(), config.segment_count);

        let segmenter = Segmenter::new(
            config.segment_duration.as_nanos() as i64,
            config.part_duration.as_nanos() as i64,
            config.segment_max_size,
            info.clone(),
            make_dts_extractor,
            playlist.clone(),
        );

        let muxer = Arc::new(Self {
            playlist,
            info,
            init_cache: Mutex::new(None),
        });
        let writer = HlsWriter {
            segmenter,
            _guard: child.drop_guard(),
        };
        (muxer, writer)
    }

    /// Answer a single file request; see [`FileQuery`] for the directives.
    pub async fn file(&self, name: &str, query: &FileQuery) -> anyhow::Result<FileResponse> {
        http::file_response(self, name, query).await
    }

    pub fn stream_info(&self) -> Arc<StreamInfo> {
        self.info.stream_info()
    }

    pub(crate) fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    /// Current init segment, rebuilt when the parameter sets change.
    pub(crate) async fn init_content(&self) -> Result<Bytes, CreateInitError> {
        let info = self.info.stream_info();

        let mut cache = self.init_cache.lock().await;
        if let Some(cache) = cache.as_ref() {
            if cache.sps == info.video_sps && cache.pps == info.video_pps {
                return Ok(cache.content.clone());
            }
        }

        let content = generate_init(&info)?;
        *cache = Some(InitCache {
            sps: info.video_sps.clone(),
            pps: info.video_pps.clone(),
            content: content.clone(),
        });
        Ok(content)
    }

    /// Block until the next segment is finalized.
    pub async fn wait_for_segment_finalized(&self) -> Result<(), Cancelled> {
        self.playlist.wait_for_segment_finalized().await
    }

    /// First segment with an ID greater than `prev_id`, waiting for one to
    /// be finalized if none exists. Lets consumers such as disk recording
    /// follow the stream segment by segment.
    pub async fn next_segment(&self, prev_id: u64) -> Result<Arc<SegmentFinalized>, Cancelled> {
        self.playlist.next_segment(prev_id).await
    }
}

/// Write side of the muxer. Owns the segmenter; the caller serializes
/// ingest. Cancels the muxer when dropped.
pub struct HlsWriter {
    segmenter: Segmenter,
    _guard: DropGuard,
}

impl HlsWriter {
    /// `nalus` are raw NALUs without start codes, grouped by PTS. `now` is
    /// injected so tests and replays control the wall clock.
    pub async fn write_h264(
        &mut self,
        now: DateTime<Utc>,
        pts: i64,
        nalus: &[Bytes],
    ) -> Result<(), WriteFrameError> {
        self.segmenter.write_h264(now, pts, nalus).await
    }

    /// `au` is a single AAC access unit.
    pub async fn write_aac(
        &mut self,
        now: DateTime<Utc>,
        pts: i64,
        au: Bytes,
    ) -> Result<(), WriteFrameError> {
        self.segmenter.write_aac(now, pts, au).await
    }
}

//! Playlist controller.
//!
//! A single task owns the live window and every index derived from it. All
//! other components talk to it through typed requests carrying a oneshot
//! reply channel, so request handling order equals channel delivery order
//! and no locking is needed. Requests that cannot be answered yet (blocking
//! playlist reload, next-part fetch, segment subscriptions) are parked
//! inside the state and answered when the window advances. Tearing down the
//! loop drops the parked reply channels, which the holders observe as
//! cancellation.

use crate::error::Cancelled;
use crate::part::{part_name, PartFinalized};
use crate::segment::SegmentFinalized;
use crate::types::{StreamInfo, FIRST_SEGMENT_ID, NANOS_PER_SECOND};
use bytes::Bytes;
use chrono::SecondsFormat;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Number of placeholder entries prepended before the first segment. Some
/// client stacks refuse playlists without history.
const GAP_COUNT: usize = 7;

pub(crate) enum SegmentOrGap {
    Segment(Arc<SegmentFinalized>),
    Gap { duration: i64 },
}

impl SegmentOrGap {
    fn duration(&self) -> i64 {
        match self {
            SegmentOrGap::Segment(segment) => segment.duration(),
            SegmentOrGap::Gap { duration } => *duration,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BlockingPlaylistResponse {
    Playlist(Bytes),
    BadRequest,
}

enum PlaylistRequest {
    Playlist {
        is_delta_update: bool,
        res: oneshot::Sender<Option<Bytes>>,
    },
    Segment {
        name: String,
        res: oneshot::Sender<Option<Arc<SegmentFinalized>>>,
    },
    SegmentFinalized {
        segment: Arc<SegmentFinalized>,
        res: oneshot::Sender<()>,
    },
    PartFinalized {
        part: Arc<PartFinalized>,
        res: oneshot::Sender<()>,
    },
    BlockingPlaylist {
        msn: u64,
        part: u64,
        is_delta_update: bool,
        res: oneshot::Sender<BlockingPlaylistResponse>,
    },
    BlockingPart {
        name: String,
        res: oneshot::Sender<Option<Bytes>>,
    },
    WaitForSegmentFinalized {
        res: oneshot::Sender<()>,
    },
    NextSegment {
        prev_id: u64,
        res: oneshot::Sender<Arc<SegmentFinalized>>,
    },
    #[cfg(test)]
    DebugState {
        res: oneshot::Sender<DebugState>,
    },
}

/// Handle to the playlist loop.
pub(crate) struct Playlist {
    tx: mpsc::Sender<PlaylistRequest>,
}

impl Playlist {
    pub(crate) fn new(token: CancellationToken, segment_count: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_playlist_loop(token, rx, PlaylistState::new(segment_count)));
        Arc::new(Self { tx })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PlaylistRequest,
    ) -> Result<T, Cancelled> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx.send(build(res_tx)).await.map_err(|_| Cancelled)?;
        res_rx.await.map_err(|_| Cancelled)
    }

    /// Render the current playlist, `None` when the window is still empty.
    pub(crate) async fn playlist(&self, is_delta_update: bool) -> Result<Option<Bytes>, Cancelled> {
        self.request(|res| PlaylistRequest::Playlist {
            is_delta_update,
            res,
        })
        .await
    }

    pub(crate) async fn segment(
        &self,
        name: &str,
    ) -> Result<Option<Arc<SegmentFinalized>>, Cancelled> {
        self.request(|res| PlaylistRequest::Segment {
            name: name.to_owned(),
            res,
        })
        .await
    }

    pub(crate) async fn segment_finalized(
        &self,
        segment: Arc<SegmentFinalized>,
    ) -> Result<(), Cancelled> {
        self.request(|res| PlaylistRequest::SegmentFinalized { segment, res })
            .await
    }

    pub(crate) async fn part_finalized(&self, part: Arc<PartFinalized>) -> Result<(), Cancelled> {
        self.request(|res| PlaylistRequest::PartFinalized { part, res })
            .await
    }

    /// Blocking playlist reload: block until `(msn, part)` exists.
    pub(crate) async fn blocking_playlist(
        &self,
        msn: u64,
        part: u64,
        is_delta_update: bool,
    ) -> Result<BlockingPlaylistResponse, Cancelled> {
        self.request(|res| PlaylistRequest::BlockingPlaylist {
            msn,
            part,
            is_delta_update,
            res,
        })
        .await
    }

    /// Fetch a part by name, blocking when it is the announced next part.
    pub(crate) async fn blocking_part(&self, name: &str) -> Result<Option<Bytes>, Cancelled> {
        self.request(|res| PlaylistRequest::BlockingPart {
            name: name.to_owned(),
            res,
        })
        .await
    }

    pub(crate) async fn wait_for_segment_finalized(&self) -> Result<(), Cancelled> {
        self.request(|res| PlaylistRequest::WaitForSegmentFinalized { res })
            .await
    }

    /// First segment with an ID greater than `prev_id`, waiting for one to
    /// be finalized if none exists yet.
    pub(crate) async fn next_segment(
        &self,
        prev_id: u64,
    ) -> Result<Arc<SegmentFinalized>, Cancelled> {
        self.request(|res| PlaylistRequest::NextSegment { prev_id, res })
            .await
    }

    #[cfg(test)]
    pub(crate) async fn debug_state(&self) -> Result<DebugState, Cancelled> {
        self.request(|res| PlaylistRequest::DebugState { res }).await
    }
}

async fn run_playlist_loop(
    token: CancellationToken,
    mut rx: mpsc::Receiver<PlaylistRequest>,
    mut state: PlaylistState,
) {
    loop {
        tokio::select! {
            // Teardown wins over queued requests.
            biased;
            () = token.cancelled() => break,
            req = rx.recv() => match req {
                Some(req) => state.handle_request(req),
                None => break,
            },
        }
    }
    debug!("playlist loop stopped");
}

struct PlaylistOnHold {
    msn: u64,
    part: u64,
    is_delta_update: bool,
    res: oneshot::Sender<BlockingPlaylistResponse>,
}

struct PartOnHold {
    name: String,
    res: oneshot::Sender<Option<Bytes>>,
}

struct NextSegmentOnHold {
    prev_id: u64,
    res: oneshot::Sender<Arc<SegmentFinalized>>,
}

#[cfg(test)]
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct DebugState {
    pub(crate) window_len: usize,
    pub(crate) gap_count: usize,
    pub(crate) segment_delete_count: u64,
    pub(crate) next_segment_id: u64,
    pub(crate) next_part_id: u64,
    pub(crate) parts_len: usize,
    pub(crate) playlists_on_hold: usize,
    pub(crate) parts_on_hold: usize,
    pub(crate) next_seg_on_hold: usize,
    pub(crate) segment_names: Vec<String>,
}

struct PlaylistState {
    segment_count: usize,
    segments: VecDeque<SegmentOrGap>,
    segments_by_name: HashMap<String, Arc<SegmentFinalized>>,
    /// Total number of entries evicted from the window; this is the
    /// `#EXT-X-MEDIA-SEQUENCE` value.
    segment_delete_count: u64,
    /// Finalized parts of all windowed segments, in ID order.
    parts: VecDeque<Arc<PartFinalized>>,
    parts_by_name: HashMap<String, Arc<PartFinalized>>,
    next_segment_id: u64,
    /// Parts of the segment currently being written.
    next_segment_parts: Vec<Arc<PartFinalized>>,
    next_part_id: u64,
    playlists_on_hold: Vec<PlaylistOnHold>,
    parts_on_hold: Vec<PartOnHold>,
    segment_finalized_on_hold: Vec<oneshot::Sender<()>>,
    next_segment_on_hold: Vec<NextSegmentOnHold>,
}

impl PlaylistState {
    fn new(segment_count: usize) -> Self {
        Self {
            segment_count,
            segments: VecDeque::new(),
            segments_by_name: HashMap::new(),
            segment_delete_count: 0,
            parts: VecDeque::new(),
            parts_by_name: HashMap::new(),
            next_segment_id: FIRST_SEGMENT_ID,
            next_segment_parts: Vec::new(),
            next_part_id: 0,
            playlists_on_hold: Vec::new(),
            parts_on_hold: Vec::new(),
            segment_finalized_on_hold: Vec::new(),
            next_segment_on_hold: Vec::new(),
        }
    }

    fn handle_request(&mut self, req: PlaylistRequest) {
        match req {
            PlaylistRequest::Playlist {
                is_delta_update,
                res,
            } => {
                let _ = res.send(self.full_playlist(is_delta_update));
            }
            PlaylistRequest::Segment { name, res } => {
                let _ = res.send(self.segments_by_name.get(&name).cloned());
            }
            PlaylistRequest::SegmentFinalized { segment, res } => {
                self.on_segment_finalized(segment);
                let _ = res.send(());
            }
            PlaylistRequest::PartFinalized { part, res } => {
                self.on_part_finalized(part);
                let _ = res.send(());
            }
            PlaylistRequest::BlockingPlaylist {
                msn,
                part,
                is_delta_update,
                res,
            } => {
                // A sequence number more than one ahead of the live edge
                // cannot become valid by waiting.
                if msn > self.next_segment_id + 1 {
                    let _ = res.send(BlockingPlaylistResponse::BadRequest);
                } else if self.has_part(msn, part) {
                    if let Some(content) = self.full_playlist(is_delta_update) {
                        let _ = res.send(BlockingPlaylistResponse::Playlist(content));
                    } else {
                        self.playlists_on_hold.push(PlaylistOnHold {
                            msn,
                            part,
                            is_delta_update,
                            res,
                        });
                    }
                } else {
                    self.playlists_on_hold.push(PlaylistOnHold {
                        msn,
                        part,
                        is_delta_update,
                        res,
                    });
                }
            }
            PlaylistRequest::BlockingPart { name, res } => {
                if let Some(part) = self.parts_by_name.get(&name) {
                    let _ = res.send(Some(part.content().clone()));
                } else if name == part_name(self.next_part_id) {
                    self.parts_on_hold.push(PartOnHold { name, res });
                } else {
                    let _ = res.send(None);
                }
            }
            PlaylistRequest::WaitForSegmentFinalized { res } => {
                self.segment_finalized_on_hold.push(res);
            }
            PlaylistRequest::NextSegment { prev_id, res } => {
                let next = self.segments.iter().find_map(|sog| match sog {
                    SegmentOrGap::Segment(seg) if seg.id() > prev_id => Some(seg.clone()),
                    _ => None,
                });
                match next {
                    Some(segment) => {
                        let _ = res.send(segment);
                    }
                    None => self
                        .next_segment_on_hold
                        .push(NextSegmentOnHold { prev_id, res }),
                }
            }
            #[cfg(test)]
            PlaylistRequest::DebugState { res } => {
                let _ = res.send(self.to_debug_state());
            }
        }
    }

    fn on_part_finalized(&mut self, part: Arc<PartFinalized>) {
        self.parts.push_back(part.clone());
        self.parts_by_name.insert(part.name(), part.clone());
        self.next_segment_parts.push(part.clone());
        self.next_part_id = part.id() + 1;

        self.check_pending();
    }

    fn on_segment_finalized(&mut self, segment: Arc<SegmentFinalized>) {
        if self.segments.is_empty() {
            for _ in 0..GAP_COUNT {
                self.segments.push_back(SegmentOrGap::Gap {
                    duration: segment.duration(),
                });
            }
        }

        self.segments_by_name
            .insert(segment.name(), segment.clone());
        self.segments
            .push_back(SegmentOrGap::Segment(segment.clone()));
        self.next_segment_id = segment.id() + 1;
        self.next_segment_parts.clear();

        while self.segments.len() > self.segment_count {
            let Some(front) = self.segments.pop_front() else {
                break;
            };
            if let SegmentOrGap::Segment(evicted) = front {
                for part in evicted.parts() {
                    self.parts_by_name.remove(&part.name());
                }
                for _ in 0..evicted.parts().len() {
                    self.parts.pop_front();
                }
                self.segments_by_name.remove(&evicted.name());
                debug!("evicted {}", evicted.name());
            }
            self.segment_delete_count += 1;
        }

        for res in std::mem::take(&mut self.segment_finalized_on_hold) {
            let _ = res.send(());
        }

        let mut still_on_hold = Vec::new();
        for req in std::mem::take(&mut self.next_segment_on_hold) {
            if segment.id() > req.prev_id {
                let _ = req.res.send(segment.clone());
            } else {
                still_on_hold.push(req);
            }
        }
        self.next_segment_on_hold = still_on_hold;

        self.check_pending();
    }

    /// Answer parked blocking requests that the window can now satisfy.
    fn check_pending(&mut self) {
        let mut still_on_hold = Vec::new();
        for req in std::mem::take(&mut self.playlists_on_hold) {
            if self.has_part(req.msn, req.part) {
                if let Some(content) = self.full_playlist(req.is_delta_update) {
                    let _ = req.res.send(BlockingPlaylistResponse::Playlist(content));
                    continue;
                }
            }
            still_on_hold.push(req);
        }
        self.playlists_on_hold = still_on_hold;

        let mut still_on_hold = Vec::new();
        for req in std::mem::take(&mut self.parts_on_hold) {
            match self.parts_by_name.get(&req.name) {
                Some(part) => {
                    let _ = req.res.send(Some(part.content().clone()));
                }
                None => still_on_hold.push(req),
            }
        }
        self.parts_on_hold = still_on_hold;
    }

    fn has_part(&self, segment_id: u64, part_id: u64) -> bool {
        let (mut segment_id, mut part_id) = (segment_id, part_id);
        for sog in &self.segments {
            let SegmentOrGap::Segment(segment) = sog else {
                continue;
            };
            if segment.id() != segment_id {
                continue;
            }
            // A part index one past the end addresses the first part of the
            // following segment.
            if part_id as usize >= segment.parts().len() {
                segment_id += 1;
                part_id = 0;
                continue;
            }
            return true;
        }
        segment_id == self.next_segment_id && (part_id as usize) < self.next_segment_parts.len()
    }

    fn full_playlist(&self, is_delta_update: bool) -> Option<Bytes> {
        if self.segments.is_empty() {
            return None;
        }

        let max_segment_duration = self
            .segments
            .iter()
            .map(SegmentOrGap::duration)
            .max()
            .unwrap_or(0);
        let target_duration = (max_segment_duration as f64 / NANOS_PER_SECOND as f64).round() as u64;
        let skip_boundary = (6 * target_duration) as f64;

        let part_target = self
            .parts
            .iter()
            .chain(self.next_segment_parts.iter())
            .map(|p| p.duration())
            .max()
            .unwrap_or(0) as f64
            / NANOS_PER_SECOND as f64;

        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:9\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));
        out.push_str(&format!(
            "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK={:.5},CAN-SKIP-UNTIL={:.5}\n",
            part_target * 2.5,
            skip_boundary,
        ));
        out.push_str(&format!("#EXT-X-PART-INF:PART-TARGET={part_target:.5}\n"));
        out.push_str(&format!(
            "#EXT-X-MEDIA-SEQUENCE:{}\n",
            self.segment_delete_count
        ));

        let mut skipped = 0usize;
        if is_delta_update {
            let mut cumulative = 0.0;
            for sog in &self.segments {
                cumulative += sog.duration() as f64 / NANOS_PER_SECOND as f64;
                if cumulative >= skip_boundary {
                    break;
                }
                skipped += 1;
            }
            out.push_str(&format!("#EXT-X-SKIP:SKIPPED-SEGMENTS={skipped}\n"));
        } else {
            out.push_str("#EXT-X-MAP:URI=\"init.mp4\"\n");
        }

        // The last two segments carry program-date-time and per-part tags.
        let segment_positions: Vec<usize> = self
            .segments
            .iter()
            .enumerate()
            .filter(|(_, sog)| matches!(sog, SegmentOrGap::Segment(_)))
            .map(|(i, _)| i)
            .collect();
        let detail_from = match segment_positions.len() {
            0 => usize::MAX,
            1 => segment_positions[0],
            n => segment_positions[n - 2],
        };

        for (i, sog) in self.segments.iter().enumerate().skip(skipped) {
            match sog {
                SegmentOrGap::Gap { duration } => {
                    out.push_str("#EXT-X-GAP\n");
                    out.push_str(&format!(
                        "#EXTINF:{:.5},\n",
                        *duration as f64 / NANOS_PER_SECOND as f64
                    ));
                    out.push_str("gap.mp4\n");
                }
                SegmentOrGap::Segment(segment) => {
                    if i >= detail_from {
                        out.push_str(&format!(
                            "#EXT-X-PROGRAM-DATE-TIME:{}\n",
                            segment
                                .start_time()
                                .to_rfc3339_opts(SecondsFormat::Millis, false)
                        ));
                        for part in segment.parts() {
                            push_part_tag(&mut out, part);
                        }
                    }
                    out.push_str(&format!(
                        "#EXTINF:{:.5},\n",
                        segment.duration() as f64 / NANOS_PER_SECOND as f64
                    ));
                    out.push_str(&segment.name());
                    out.push('\n');
                }
            }
        }

        for part in &self.next_segment_parts {
            push_part_tag(&mut out, part);
        }
        out.push_str(&format!(
            "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"{}\"\n",
            part_name(self.next_part_id)
        ));

        Some(Bytes::from(out))
    }

    #[cfg(test)]
    fn to_debug_state(&self) -> DebugState {
        DebugState {
            window_len: self.segments.len(),
            gap_count: self
                .segments
                .iter()
                .filter(|sog| matches!(sog, SegmentOrGap::Gap { .. }))
                .count(),
            segment_delete_count: self.segment_delete_count,
            next_segment_id: self.next_segment_id,
            next_part_id: self.next_part_id,
            parts_len: self.parts.len(),
            playlists_on_hold: self.playlists_on_hold.len(),
            parts_on_hold: self.parts_on_hold.len(),
            next_seg_on_hold: self.next_segment_on_hold.len(),
            segment_names: {
                let mut names: Vec<String> = self.segments_by_name.keys().cloned().collect();
                names.sort();
                names
            },
        }
    }
}

fn push_part_tag(out: &mut String, part: &PartFinalized) {
    out.push_str(&format!(
        "#EXT-X-PART:DURATION={:.5},URI=\"{}\"",
        part.duration() as f64 / NANOS_PER_SECOND as f64,
        part.name()
    ));
    if part.is_independent() {
        out.push_str(",INDEPENDENT=YES");
    }
    out.push('\n');
}

/// Render the primary playlist pointing at the stream variant.
pub(crate) fn primary_playlist(info: &StreamInfo) -> Bytes {
    let mut codecs = Vec::new();
    if info.video_track_exist && info.video_sps.len() >= 4 {
        codecs.push(format!(
            "avc1.{:02x}{:02x}{:02x}",
            info.video_sps[1], info.video_sps[2], info.video_sps[3]
        ));
    }
    if info.audio_track_exist {
        codecs.push(format!("mp4a.40.{}", info.audio_type));
    }

    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:9\n");
    out.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");
    out.push('\n');
    out.push_str(&format!(
        "#EXT-X-STREAM-INF:BANDWIDTH=200000,CODECS=\"{}\"\n",
        codecs.join(",")
    ));
    out.push_str("stream.m3u8\n");

    Bytes::from(out)
}

//! Sample stream segmentation.

use crate::error::WriteFrameError;
use crate::playlist::Playlist;
use crate::segment::Segment;
use crate::types::{
    unix_nanos, AudioSample, DtsExtractor, DtsExtractorFactory, IdCounter, StreamInfoProvider,
    VideoSample, FIRST_SEGMENT_ID, NANOS_PER_SECOND,
};
use bytes::{BufMut, Bytes};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashSet;
use std::sync::Arc;

const NALU_TYPE_NON_IDR: u8 = 1;
const NALU_TYPE_IDR: u8 = 5;

/// Part duration search step and cap.
const PART_DURATION_STEP: i64 = 5 * 1_000_000;
const MAX_PART_DURATION: i64 = 5 * NANOS_PER_SECOND;

/// Prefix every NALU with its big-endian 32-bit length.
fn frame_avcc(nalus: &[Bytes]) -> Bytes {
    let size = nalus.iter().map(|n| 4 + n.len()).sum();
    let mut buf = Vec::with_capacity(size);
    for nalu in nalus {
        buf.put_u32(nalu.len() as u32);
        buf.put_slice(nalu);
    }
    Bytes::from(buf)
}

fn part_duration_is_compatible(part_duration: i64, sample_duration: i64) -> bool {
    if sample_duration > part_duration {
        return false;
    }

    let mut f = part_duration / sample_duration;
    if part_duration % sample_duration != 0 {
        f += 1;
    }
    f *= sample_duration;

    part_duration > f * 85 / 100
}

fn part_duration_is_compatible_with_all(
    part_duration: i64,
    sample_durations: &HashSet<i64>,
) -> bool {
    sample_durations
        .iter()
        .all(|&sd| part_duration_is_compatible(part_duration, sd))
}

fn find_compatible_part_duration(
    min_part_duration: i64,
    sample_durations: &HashSet<i64>,
) -> i64 {
    let mut duration = min_part_duration;
    while duration < MAX_PART_DURATION {
        if part_duration_is_compatible_with_all(duration, sample_durations) {
            break;
        }
        duration += PART_DURATION_STEP;
    }
    duration
}

/// Converts the ingest sample stream into parts and segments.
///
/// Single-threaded; serialized by whoever owns the writer half of the muxer.
pub(crate) struct Segmenter {
    segment_duration: i64,
    part_duration: i64,
    segment_max_size: u64,
    info: Arc<dyn StreamInfoProvider>,
    make_dts_extractor: DtsExtractorFactory,
    playlist: Arc<Playlist>,

    video_track: bool,
    audio_timescale: Option<u32>,

    /// Unix nanoseconds of the first accepted sample; the muxer epoch.
    muxer_start_time: i64,
    /// First decode timestamp on the ingest clock.
    start_dts: i64,
    epoch_set: bool,
    dts_extractor: Option<Box<dyn DtsExtractor>>,
    last_sps: Bytes,
    current_segment: Option<Segment>,
    segment_id_counter: IdCounter,
    part_id_counter: IdCounter,
    next_video_sample: Option<VideoSample>,
    next_audio_sample: Option<AudioSample>,
    first_segment_finalized: bool,
    sample_durations: HashSet<i64>,
    adjusted_part_duration: i64,
}

impl Segmenter {
    pub(crate) fn new(
        segment_duration: i64,
        part_duration: i64,
        segment_max_size: u64,
        info: Arc<dyn StreamInfoProvider>,
        make_dts_extractor: DtsExtractorFactory,
        playlist: Arc<Playlist>,
    ) -> Self {
        let snapshot = info.stream_info();
        Self {
            segment_duration,
            part_duration,
            segment_max_size,
            make_dts_extractor,
            playlist,
            video_track: snapshot.video_track_exist,
            audio_timescale: snapshot
                .audio_track_exist
                .then_some(snapshot.audio_clock_rate),
            muxer_start_time: 0,
            start_dts: 0,
            epoch_set: false,
            dts_extractor: None,
            last_sps: snapshot.video_sps.clone(),
            current_segment: None,
            segment_id_counter: IdCounter::new(FIRST_SEGMENT_ID),
            part_id_counter: IdCounter::new(0),
            next_video_sample: None,
            next_audio_sample: None,
            first_segment_finalized: false,
            sample_durations: HashSet::new(),
            adjusted_part_duration: part_duration,
            info,
        }
    }

    // iPhone clients fail when part durations fall below 85% of the declared
    // part target. Track every observed sample duration and stretch the
    // target until all of them divide into it cleanly enough.
    fn adjust_part_duration(&mut self, duration: i64) {
        if self.first_segment_finalized || duration <= 0 {
            return;
        }

        if self.sample_durations.insert(duration) {
            self.adjusted_part_duration =
                find_compatible_part_duration(self.part_duration, &self.sample_durations);
        }
    }

    pub(crate) async fn write_h264(
        &mut self,
        now: DateTime<Utc>,
        pts: i64,
        nalus: &[Bytes],
    ) -> Result<(), WriteFrameError> {
        if !self.video_track {
            return Ok(());
        }

        let mut idr_present = false;
        let mut non_idr_present = false;
        for nalu in nalus {
            match nalu.first().map(|b| b & 0x1F) {
                Some(NALU_TYPE_IDR) => idr_present = true,
                Some(NALU_TYPE_NON_IDR) => non_idr_present = true,
                _ => {}
            }
        }
        if !idr_present && !non_idr_present {
            return Ok(());
        }

        let avcc = frame_avcc(nalus);

        let dts = match &mut self.dts_extractor {
            Some(extractor) => extractor.extract(&avcc, pts)?,
            None => {
                // The stream is not decodable until the first IDR.
                if !idr_present {
                    return Ok(());
                }
                let mut extractor = (self.make_dts_extractor)();
                let dts = extractor.extract(&avcc, pts)?;
                self.dts_extractor = Some(extractor);
                self.start_dts = dts;
                self.muxer_start_time = unix_nanos(now);
                self.epoch_set = true;
                self.last_sps = self.info.stream_info().video_sps.clone();
                dts
            }
        };

        let sample = VideoSample {
            pts: self.muxer_start_time + (pts - self.start_dts),
            dts: self.muxer_start_time + (dts - self.start_dts),
            avcc,
            idr_present,
            next_dts: 0,
        };
        let sample_dts = sample.dts;

        // One sample of lookahead so durations are known when writing.
        if let Some(mut prev) = self.next_video_sample.replace(sample) {
            prev.next_dts = sample_dts.max(prev.dts);
            self.write_h264_entry(prev).await?;
        }
        Ok(())
    }

    async fn write_h264_entry(&mut self, sample: VideoSample) -> Result<(), WriteFrameError> {
        self.adjust_part_duration(sample.duration());

        let segment = self.current_segment.get_or_insert_with(|| {
            Segment::new(
                self.segment_id_counter.next_id(),
                DateTime::from_timestamp_nanos(sample.dts),
                sample.dts - self.muxer_start_time,
                self.muxer_start_time,
                self.segment_max_size,
                self.video_track,
                self.audio_timescale,
                self.playlist.clone(),
                &mut self.part_id_counter,
            )
        });

        let segment_start_dts = segment.start_dts();
        segment
            .write_video(sample, self.adjusted_part_duration, &mut self.part_id_counter)
            .await?;

        let (next_idr, next_dts) = match &self.next_video_sample {
            Some(next) => (next.idr_present, next.dts),
            None => return Ok(()),
        };
        // Segments can only start on an IDR.
        if !next_idr {
            return Ok(());
        }

        let sps = self.info.stream_info().video_sps.clone();
        let sps_changed = sps != self.last_sps;

        if (next_dts - self.muxer_start_time) - segment_start_dts >= self.segment_duration
            || sps_changed
        {
            if let Some(segment) = self.current_segment.take() {
                let finalized = segment.finalize(Some(next_dts)).await?;
                info!(
                    "wrote {} [{:.3}s, {} bytes]",
                    finalized.name(),
                    finalized.duration() as f64 / NANOS_PER_SECOND as f64,
                    finalized.size()
                );
                self.playlist.segment_finalized(finalized).await?;
                self.first_segment_finalized = true;
            }

            if sps_changed {
                debug!("sps changed, readjusting part duration");
                self.last_sps = sps;
                self.sample_durations.clear();
                self.adjusted_part_duration = self.part_duration;
                self.first_segment_finalized = false;
            }
        }
        Ok(())
    }

    pub(crate) async fn write_aac(
        &mut self,
        now: DateTime<Utc>,
        pts: i64,
        au: Bytes,
    ) -> Result<(), WriteFrameError> {
        if self.audio_timescale.is_none() {
            return Ok(());
        }
        if self.video_track {
            // Audio before the first IDR cannot be played back.
            if !self.epoch_set {
                return Ok(());
            }
        } else if !self.epoch_set {
            self.muxer_start_time = unix_nanos(now);
            self.start_dts = pts;
            self.epoch_set = true;
        }

        let sample = AudioSample {
            pts: self.muxer_start_time + (pts - self.start_dts),
            au,
            next_pts: 0,
        };
        let sample_pts = sample.pts;

        if let Some(mut prev) = self.next_audio_sample.replace(sample) {
            prev.next_pts = sample_pts.max(prev.pts);
            self.write_aac_entry(prev).await?;
        }
        Ok(())
    }

    async fn write_aac_entry(&mut self, sample: AudioSample) -> Result<(), WriteFrameError> {
        if self.video_track {
            // Audio rides along in whatever segment video has open.
            let Some(segment) = &mut self.current_segment else {
                return Ok(());
            };
            segment
                .write_audio(sample, self.adjusted_part_duration, &mut self.part_id_counter)
                .await?;
            return Ok(());
        }

        self.adjust_part_duration(sample.duration());

        let segment = self.current_segment.get_or_insert_with(|| {
            Segment::new(
                self.segment_id_counter.next_id(),
                DateTime::from_timestamp_nanos(sample.pts),
                sample.pts - self.muxer_start_time,
                self.muxer_start_time,
                self.segment_max_size,
                self.video_track,
                self.audio_timescale,
                self.playlist.clone(),
                &mut self.part_id_counter,
            )
        });

        let segment_start_dts = segment.start_dts();
        segment
            .write_audio(sample, self.adjusted_part_duration, &mut self.part_id_counter)
            .await?;

        let next_pts = match &self.next_audio_sample {
            Some(next) => next.pts,
            None => return Ok(()),
        };
        if (next_pts - self.muxer_start_time) - segment_start_dts >= self.segment_duration {
            if let Some(segment) = self.current_segment.take() {
                let finalized = segment.finalize(None).await?;
                info!(
                    "wrote {} [{:.3}s, {} bytes]",
                    finalized.name(),
                    finalized.duration() as f64 / NANOS_PER_SECOND as f64,
                    finalized.size()
                );
                self.playlist.segment_finalized(finalized).await?;
                self.first_segment_finalized = true;
            }
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PassthroughDtsExtractor, StreamInfo};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct TestInfo(Mutex<StreamInfo>);

    impl TestInfo {
        fn new(info: StreamInfo) -> Arc<Self> {
            Arc::new(Self(Mutex::new(info)))
        }

        fn set_sps(&self, sps: Bytes) {
            self.0.lock().unwrap().video_sps = sps;
        }
    }

    impl StreamInfoProvider for TestInfo {
        fn stream_info(&self) -> Arc<StreamInfo> {
            Arc::new(self.0.lock().unwrap().clone())
        }
    }

    fn video_info() -> StreamInfo {
        StreamInfo {
            video_track_exist: true,
            video_sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x16, 0xac]),
            video_pps: Bytes::from_static(&[0x08]),
            video_width: 640,
            video_height: 480,
            ..StreamInfo::default()
        }
    }

    fn audio_info() -> StreamInfo {
        StreamInfo {
            audio_track_exist: true,
            audio_track_config: Bytes::from_static(&[0x11, 0x90]),
            audio_channel_count: 2,
            audio_clock_rate: 48_000,
            audio_type: 2,
            ..StreamInfo::default()
        }
    }

    fn new_test_segmenter(
        info: Arc<TestInfo>,
        segment_duration: i64,
        token: &CancellationToken,
    ) -> (Segmenter, Arc<Playlist>) {
        let playlist = Playlist::new(token.clone(), 9);
        let segmenter = Segmenter::new(
            segment_duration,
            200_000_000,
            50 * 1024 * 1024,
            info,
            Box::new(|| Box::new(PassthroughDtsExtractor)),
            playlist.clone(),
        );
        (segmenter, playlist)
    }

    fn now_at(pts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(pts)
    }

    fn idr() -> Bytes {
        Bytes::from_static(&[0x65, 0x88, 0x84, 0x00])
    }

    fn non_idr() -> Bytes {
        Bytes::from_static(&[0x41, 0x9a, 0x24, 0x6c])
    }

    const MILLISECOND: i64 = 1_000_000;

    #[test]
    fn test_frame_avcc() {
        let got = frame_avcc(&[Bytes::from_static(b"ab"), Bytes::from_static(b"cdef")]);
        assert_eq!(
            Bytes::from_static(&[0, 0, 0, 2, b'a', b'b', 0, 0, 0, 4, b'c', b'd', b'e', b'f']),
            got
        );
    }

    #[test]
    fn test_find_compatible_part_duration() {
        // Sample duration divides the target cleanly enough.
        let mut durations = HashSet::new();
        durations.insert(100 * MILLISECOND);
        assert_eq!(
            200 * MILLISECOND,
            find_compatible_part_duration(200 * MILLISECOND, &durations)
        );

        // ~30fps forces the target up to 115ms.
        let mut durations = HashSet::new();
        durations.insert(33_333_333);
        assert_eq!(
            115 * MILLISECOND,
            find_compatible_part_duration(100 * MILLISECOND, &durations)
        );

        // A sample longer than the target is never compatible with it.
        assert!(!part_duration_is_compatible(100, 200));
    }

    #[tokio::test]
    async fn test_zero_duration_writes() {
        let token = CancellationToken::new();
        let (mut segmenter, _playlist) =
            new_test_segmenter(TestInfo::new(video_info()), NANOS_PER_SECOND, &token);

        segmenter.write_h264(now_at(0), 0, &[idr()]).await.unwrap();
        segmenter.write_h264(now_at(0), 0, &[idr()]).await.unwrap();
        token.cancel();
    }

    #[tokio::test]
    async fn test_drops_audio_and_non_idr_before_first_idr() {
        let token = CancellationToken::new();
        let info = StreamInfo {
            audio_track_exist: true,
            audio_clock_rate: 48_000,
            ..video_info()
        };
        let (mut segmenter, _playlist) =
            new_test_segmenter(TestInfo::new(info), NANOS_PER_SECOND, &token);

        segmenter
            .write_h264(now_at(0), 0, &[non_idr()])
            .await
            .unwrap();
        assert!(segmenter.next_video_sample.is_none());

        segmenter
            .write_aac(now_at(0), 0, Bytes::from_static(b"au"))
            .await
            .unwrap();
        assert!(segmenter.next_audio_sample.is_none());

        // NALU types other than IDR and non-IDR are dropped outright.
        segmenter
            .write_h264(now_at(0), 0, &[Bytes::from_static(&[0x67, 0x64])])
            .await
            .unwrap();
        assert!(segmenter.dts_extractor.is_none());

        segmenter.write_h264(now_at(0), 0, &[idr()]).await.unwrap();
        assert!(segmenter.next_video_sample.is_some());
        token.cancel();
    }

    #[tokio::test]
    async fn test_segment_cut_on_idr_after_duration() {
        let token = CancellationToken::new();
        let (mut segmenter, playlist) =
            new_test_segmenter(TestInfo::new(video_info()), 500 * MILLISECOND, &token);

        segmenter.write_h264(now_at(0), 0, &[idr()]).await.unwrap();
        for i in 1..10 {
            let pts = i * 100 * MILLISECOND;
            segmenter
                .write_h264(now_at(pts), pts, &[non_idr()])
                .await
                .unwrap();
        }
        assert!(playlist.segment("seg7.mp4").await.unwrap().is_none());

        // The IDR one second in closes the first segment.
        let pts = NANOS_PER_SECOND;
        segmenter
            .write_h264(now_at(pts), pts, &[idr()])
            .await
            .unwrap();

        let segment = playlist.segment("seg7.mp4").await.unwrap().unwrap();
        assert_eq!(7, segment.id());
        assert_eq!(NANOS_PER_SECOND, segment.duration());
        assert!(!segment.parts().is_empty());
        assert!(segmenter.first_segment_finalized);

        let state = playlist.debug_state().await.unwrap();
        assert_eq!(8, state.next_segment_id);

        let content = playlist.playlist(false).await.unwrap().unwrap();
        let content = std::str::from_utf8(&content).unwrap();
        assert!(content.contains("#EXT-X-PART:"), "{content}");
        assert!(content.contains("INDEPENDENT=YES"), "{content}");
        token.cancel();
    }

    #[tokio::test]
    async fn test_sps_change_cuts_segment_and_resets_adaptation() {
        let token = CancellationToken::new();
        let info = TestInfo::new(video_info());
        let (mut segmenter, playlist) =
            new_test_segmenter(info.clone(), 500 * MILLISECOND, &token);

        segmenter.write_h264(now_at(0), 0, &[idr()]).await.unwrap();
        for i in 1..10 {
            let pts = i * 100 * MILLISECOND;
            segmenter
                .write_h264(now_at(pts), pts, &[non_idr()])
                .await
                .unwrap();
        }
        let pts = NANOS_PER_SECOND;
        segmenter
            .write_h264(now_at(pts), pts, &[idr()])
            .await
            .unwrap();
        assert!(segmenter.first_segment_finalized);
        assert!(!segmenter.sample_durations.is_empty());

        info.set_sps(Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e, 0xab]));

        // Next IDR arrives well before the segment duration; the parameter
        // change must cut anyway.
        for i in 11..13 {
            let pts = i * 100 * MILLISECOND;
            segmenter
                .write_h264(now_at(pts), pts, &[non_idr()])
                .await
                .unwrap();
        }
        let pts = 1300 * MILLISECOND;
        segmenter
            .write_h264(now_at(pts), pts, &[idr()])
            .await
            .unwrap();

        assert!(playlist.segment("seg8.mp4").await.unwrap().is_some());
        assert!(!segmenter.first_segment_finalized);
        assert!(segmenter.sample_durations.is_empty());
        assert_eq!(segmenter.part_duration, segmenter.adjusted_part_duration);
        token.cancel();
    }

    #[tokio::test]
    async fn test_adaptation_frozen_after_first_segment() {
        let token = CancellationToken::new();
        let (mut segmenter, _playlist) =
            new_test_segmenter(TestInfo::new(video_info()), NANOS_PER_SECOND, &token);

        segmenter.first_segment_finalized = true;
        segmenter.adjust_part_duration(33_333_333);
        assert!(segmenter.sample_durations.is_empty());
        assert_eq!(segmenter.part_duration, segmenter.adjusted_part_duration);
        token.cancel();
    }

    #[tokio::test]
    async fn test_audio_rides_in_video_segment() {
        let token = CancellationToken::new();
        let info = StreamInfo {
            audio_track_exist: true,
            audio_track_config: Bytes::from_static(&[0x12, 0x10]),
            audio_channel_count: 1,
            audio_clock_rate: 48_000,
            audio_type: 2,
            ..video_info()
        };
        let (mut segmenter, playlist) =
            new_test_segmenter(TestInfo::new(info), NANOS_PER_SECOND, &token);

        segmenter.write_h264(now_at(0), 0, &[idr()]).await.unwrap();
        segmenter
            .write_aac(now_at(0), 0, Bytes::from_static(b"aaaa"))
            .await
            .unwrap();
        segmenter
            .write_aac(now_at(100 * MILLISECOND), 100 * MILLISECOND, Bytes::from_static(b"bbbb"))
            .await
            .unwrap();
        segmenter
            .write_h264(now_at(300 * MILLISECOND), 300 * MILLISECOND, &[non_idr()])
            .await
            .unwrap();
        segmenter
            .write_aac(now_at(200 * MILLISECOND), 200 * MILLISECOND, Bytes::from_static(b"cccc"))
            .await
            .unwrap();

        let pts = 2 * NANOS_PER_SECOND;
        segmenter
            .write_h264(now_at(pts), pts, &[idr()])
            .await
            .unwrap();

        let segment = playlist.segment("seg7.mp4").await.unwrap().unwrap();
        // Two 8-byte AVCC samples plus the one audio sample written after
        // the segment opened.
        assert_eq!(20, segment.size());
        token.cancel();
    }

    #[tokio::test]
    async fn test_audio_only_stream() {
        let token = CancellationToken::new();
        let (mut segmenter, playlist) =
            new_test_segmenter(TestInfo::new(audio_info()), 500 * MILLISECOND, &token);

        for i in 0..=6 {
            let pts = i * 100 * MILLISECOND;
            segmenter
                .write_aac(now_at(pts), pts, Bytes::from_static(b"auau"))
                .await
                .unwrap();
        }

        // Six 100ms samples made it into the segment before the cut.
        let segment = playlist.segment("seg7.mp4").await.unwrap().unwrap();
        assert_eq!(600 * MILLISECOND, segment.duration());
        assert!(segment.parts().iter().all(|p| p.is_independent()));

        let content = playlist.playlist(false).await.unwrap().unwrap();
        let content = std::str::from_utf8(&content).unwrap();
        assert!(content.contains("INDEPENDENT=YES"), "{content}");
        token.cancel();
    }
}

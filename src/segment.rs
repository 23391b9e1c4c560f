use crate::error::WriteFrameError;
use crate::part::{MuxerPart, PartFinalized};
use crate::playlist::Playlist;
use crate::types::{AudioSample, IdCounter, VideoSample};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub(crate) fn segment_name(id: u64) -> String {
    format!("seg{id}.mp4")
}

/// Media segment under construction. Owns the open part and the parts
/// already cut; finalized parts are published to the playlist as they land.
pub(crate) struct Segment {
    id: u64,
    start_time: DateTime<Utc>,
    /// Nanoseconds relative to the muxer epoch.
    start_dts: i64,
    muxer_start_time: i64,
    segment_max_size: u64,
    video_track: bool,
    audio_timescale: Option<u32>,
    playlist: Arc<Playlist>,
    size: u64,
    parts: Vec<Arc<PartFinalized>>,
    current_part: MuxerPart,
}

impl Segment {
    pub(crate) fn new(
        id: u64,
        start_time: DateTime<Utc>,
        start_dts: i64,
        muxer_start_time: i64,
        segment_max_size: u64,
        video_track: bool,
        audio_timescale: Option<u32>,
        playlist: Arc<Playlist>,
        part_id_counter: &mut IdCounter,
    ) -> Self {
        Self {
            id,
            start_time,
            start_dts,
            muxer_start_time,
            segment_max_size,
            video_track,
            audio_timescale,
            playlist,
            size: 0,
            parts: Vec::new(),
            current_part: MuxerPart::new(part_id_counter.next_id(), video_track),
        }
    }

    pub(crate) fn start_dts(&self) -> i64 {
        self.start_dts
    }

    pub(crate) async fn write_video(
        &mut self,
        sample: VideoSample,
        adjusted_part_duration: i64,
        part_id_counter: &mut IdCounter,
    ) -> Result<(), WriteFrameError> {
        let sample_size = sample.avcc.len() as u64;
        if self.size + sample_size > self.segment_max_size {
            return Err(WriteFrameError::MaximumSegmentSize);
        }
        self.current_part.write_video(sample);
        self.size += sample_size;

        if self.current_part.duration() >= adjusted_part_duration {
            self.switch_part(part_id_counter).await?;
        }
        Ok(())
    }

    pub(crate) async fn write_audio(
        &mut self,
        sample: AudioSample,
        adjusted_part_duration: i64,
        part_id_counter: &mut IdCounter,
    ) -> Result<(), WriteFrameError> {
        let sample_size = sample.au.len() as u64;
        if self.size + sample_size > self.segment_max_size {
            return Err(WriteFrameError::MaximumSegmentSize);
        }
        self.current_part.write_audio(sample);
        self.size += sample_size;

        // With a video track, parts switch on video sample boundaries only.
        if !self.video_track && self.current_part.duration() >= adjusted_part_duration {
            self.switch_part(part_id_counter).await?;
        }
        Ok(())
    }

    async fn switch_part(&mut self, part_id_counter: &mut IdCounter) -> Result<(), WriteFrameError> {
        let next = MuxerPart::new(part_id_counter.next_id(), self.video_track);
        let part = std::mem::replace(&mut self.current_part, next);

        let finalized = Arc::new(part.finalize(self.muxer_start_time, self.audio_timescale)?);
        self.parts.push(finalized.clone());
        self.playlist.part_finalized(finalized).await?;
        Ok(())
    }

    /// Render the trailing part and seal the segment.
    ///
    /// `next_video_dts` is the decode timestamp of the sample opening the
    /// following segment; without video the duration is the sum of the parts.
    pub(crate) async fn finalize(
        self,
        next_video_dts: Option<i64>,
    ) -> Result<Arc<SegmentFinalized>, WriteFrameError> {
        let Self {
            id,
            start_time,
            start_dts,
            muxer_start_time,
            audio_timescale,
            playlist,
            size,
            mut parts,
            current_part,
            ..
        } = self;

        if !current_part.is_empty() {
            let finalized = Arc::new(current_part.finalize(muxer_start_time, audio_timescale)?);
            parts.push(finalized.clone());
            playlist.part_finalized(finalized).await?;
        }

        let rendered_duration = match next_video_dts {
            Some(next_dts) => (next_dts - muxer_start_time) - start_dts,
            None => parts.iter().map(|p| p.rendered_duration).sum(),
        };

        Ok(Arc::new(SegmentFinalized::new(
            id,
            start_time,
            start_dts,
            parts,
            rendered_duration,
            size,
        )))
    }
}

/// Sealed media segment held in the live window.
#[derive(Clone, Debug)]
pub struct SegmentFinalized {
    id: u64,
    start_time: DateTime<Utc>,
    start_dts: i64,
    parts: Vec<Arc<PartFinalized>>,
    rendered_duration: i64,
    size: u64,
}

impl SegmentFinalized {
    pub(crate) fn new(
        id: u64,
        start_time: DateTime<Utc>,
        start_dts: i64,
        parts: Vec<Arc<PartFinalized>>,
        rendered_duration: i64,
        size: u64,
    ) -> Self {
        Self {
            id,
            start_time,
            start_dts,
            parts,
            rendered_duration,
            size,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> String {
        segment_name(self.id)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Decode timestamp of the first sample, relative to the muxer epoch.
    pub fn start_dts(&self) -> i64 {
        self.start_dts
    }

    pub fn parts(&self) -> &[Arc<PartFinalized>] {
        &self.parts
    }

    /// Duration in nanoseconds.
    pub fn duration(&self) -> i64 {
        self.rendered_duration
    }

    /// Total payload bytes across all parts.
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FIRST_SEGMENT_ID;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_write_video_max_segment_size() {
        let token = CancellationToken::new();
        let playlist = Playlist::new(token.clone(), 3);
        let mut part_id_counter = IdCounter::new(0);

        let mut segment = Segment::new(
            FIRST_SEGMENT_ID,
            Utc::now(),
            0,
            0,
            4,
            true,
            None,
            playlist,
            &mut part_id_counter,
        );

        let sample = VideoSample {
            avcc: Bytes::from_static(b"abc"),
            idr_present: true,
            ..VideoSample::default()
        };
        segment
            .write_video(sample.clone(), i64::MAX, &mut part_id_counter)
            .await
            .unwrap();

        // A second 3-byte sample would exceed the 4-byte cap.
        let got = segment
            .write_video(sample, i64::MAX, &mut part_id_counter)
            .await;
        assert!(matches!(got, Err(WriteFrameError::MaximumSegmentSize)));

        token.cancel();
    }

    #[tokio::test]
    async fn test_finalize_durations() {
        let token = CancellationToken::new();
        let playlist = Playlist::new(token.clone(), 3);
        let mut part_id_counter = IdCounter::new(0);

        let muxer_start_time = 1_000_000_000;
        let mut segment = Segment::new(
            FIRST_SEGMENT_ID,
            Utc::now(),
            0,
            muxer_start_time,
            u64::MAX,
            true,
            None,
            playlist,
            &mut part_id_counter,
        );

        let sample = VideoSample {
            pts: muxer_start_time,
            dts: muxer_start_time,
            next_dts: muxer_start_time + 500_000_000,
            avcc: Bytes::from_static(b"abcd"),
            idr_present: true,
        };
        segment
            .write_video(sample, i64::MAX, &mut part_id_counter)
            .await
            .unwrap();

        let finalized = segment
            .finalize(Some(muxer_start_time + 2_000_000_000))
            .await
            .unwrap();
        assert_eq!(2_000_000_000, finalized.duration());
        assert_eq!("seg7.mp4", finalized.name());
        assert_eq!(1, finalized.parts().len());
        assert_eq!(4, finalized.size());

        token.cancel();
    }
}

//! Partial segment (`moof`+`mdat`) generation.

use crate::error::GeneratePartError;
use crate::mp4::{
    Boxes, Mp4Box, TrunEntries, TrunEntryV0, TrunEntryV1, SAMPLE_FLAG_NON_SYNC,
    TRUN_DATA_OFFSET_PRESENT, TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT,
    TRUN_SAMPLE_DURATION_PRESENT, TRUN_SAMPLE_FLAGS_PRESENT, TRUN_SAMPLE_SIZE_PRESENT,
};
use crate::types::{nanos_to_timescale, AudioSample, VideoSample, VIDEO_TIMESCALE, VIDEO_TRACK_ID};
use bytes::Bytes;

pub(crate) fn part_name(id: u64) -> String {
    format!("part{id}.mp4")
}

fn try_u32(v: i64, field: &'static str) -> Result<u32, GeneratePartError> {
    u32::try_from(v).map_err(|e| GeneratePartError::TryFromInt(field, e))
}

fn try_i32(v: i64, field: &'static str) -> Result<i32, GeneratePartError> {
    i32::try_from(v).map_err(|e| GeneratePartError::TryFromInt(field, e))
}

fn try_u64(v: i64, field: &'static str) -> Result<u64, GeneratePartError> {
    u64::try_from(v).map_err(|e| GeneratePartError::TryFromInt(field, e))
}

/// Serialize buffered samples as `moof`+`mdat`.
///
/// The video `traf` is present iff the part holds video samples, the audio
/// `traf` iff an audio track is configured and the part holds audio samples.
/// Data offsets are computed up front so each `trun` points into the `mdat`
/// payload: video samples first, then audio.
pub(crate) fn generate_part(
    muxer_start_time: i64,
    video_track: bool,
    audio_timescale: Option<u32>,
    video_samples: &[VideoSample],
    audio_samples: &[AudioSample],
) -> Result<Bytes, GeneratePartError> {
    /*
       moof
       - mfhd
       - traf (video)
         - tfhd
         - tfdt
         - trun
       - traf (audio)
         - tfhd
         - tfdt
         - trun
       mdat
    */

    let has_video_traf = !video_samples.is_empty();
    let has_audio_traf = audio_timescale.is_some() && !audio_samples.is_empty();
    let audio_track_id = if video_track { 2 } else { VIDEO_TRACK_ID };

    let mfhd_offset = 24;
    let mut mdat_offset = mfhd_offset;
    if has_video_traf {
        let video_trun_size = video_samples.len() * 16 + 20;
        mdat_offset += video_trun_size + 44;
    }
    if has_audio_traf {
        let audio_trun_size = audio_samples.len() * 8 + 20;
        mdat_offset += audio_trun_size + 44;
    }

    let video_mdat_size = video_samples.iter().map(|s| s.avcc.len()).sum::<usize>();
    let video_data_offset = try_i32((mdat_offset + 8) as i64, "video data offset")?;
    let audio_data_offset =
        try_i32((mdat_offset + 8 + video_mdat_size) as i64, "audio data offset")?;

    let mut moof = Boxes::new(Mp4Box::Moof).with_child(Boxes::new(Mp4Box::Mfhd {
        sequence_number: 0,
    }));
    if has_video_traf {
        moof.children
            .push(generate_video_traf(muxer_start_time, video_samples, video_data_offset)?);
    }
    if let (true, Some(timescale)) = (has_audio_traf, audio_timescale) {
        moof.children.push(generate_audio_traf(
            muxer_start_time,
            timescale,
            audio_track_id,
            audio_samples,
            audio_data_offset,
        )?);
    }

    let mut payload = Vec::with_capacity(video_samples.len() + audio_samples.len());
    payload.extend(video_samples.iter().map(|s| s.avcc.clone()));
    payload.extend(audio_samples.iter().map(|s| s.au.clone()));
    let mdat = Boxes::new(Mp4Box::Mdat { payload });

    let mut buf = Vec::with_capacity(moof.size() + mdat.size());
    moof.marshal(&mut buf);
    mdat.marshal(&mut buf);

    Ok(Bytes::from(buf))
}

fn generate_video_traf(
    muxer_start_time: i64,
    samples: &[VideoSample],
    data_offset: i32,
) -> Result<Boxes, GeneratePartError> {
    let mut entries = Vec::with_capacity(samples.len());
    for sample in samples {
        let flags = if sample.idr_present {
            0
        } else {
            SAMPLE_FLAG_NON_SYNC
        };
        entries.push(TrunEntryV1 {
            sample_duration: try_u32(
                nanos_to_timescale(sample.duration(), VIDEO_TIMESCALE),
                "video sample duration",
            )?,
            sample_size: u32::try_from(sample.avcc.len())
                .map_err(|e| GeneratePartError::TryFromInt("video sample size", e))?,
            sample_flags: flags,
            sample_composition_time_offset: try_i32(
                nanos_to_timescale(sample.pts - sample.dts, VIDEO_TIMESCALE),
                "video cts offset",
            )?,
        });
    }

    let first_dts = samples.first().map_or(muxer_start_time, |s| s.dts);
    let base_media_decode_time = try_u64(
        nanos_to_timescale(first_dts - muxer_start_time, VIDEO_TIMESCALE),
        "video base media decode time",
    )?;

    Ok(Boxes::new(Mp4Box::Traf).with_children(vec![
        Boxes::new(Mp4Box::Tfhd {
            track_id: VIDEO_TRACK_ID,
        }),
        Boxes::new(Mp4Box::Tfdt {
            base_media_decode_time,
        }),
        Boxes::new(Mp4Box::Trun {
            flags: TRUN_DATA_OFFSET_PRESENT
                | TRUN_SAMPLE_DURATION_PRESENT
                | TRUN_SAMPLE_SIZE_PRESENT
                | TRUN_SAMPLE_FLAGS_PRESENT
                | TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT,
            data_offset,
            entries: TrunEntries::V1(entries),
        }),
    ]))
}

fn generate_audio_traf(
    muxer_start_time: i64,
    timescale: u32,
    track_id: u32,
    samples: &[AudioSample],
    data_offset: i32,
) -> Result<Boxes, GeneratePartError> {
    let mut entries = Vec::with_capacity(samples.len());
    for sample in samples {
        entries.push(TrunEntryV0 {
            sample_duration: try_u32(
                nanos_to_timescale(sample.duration(), timescale),
                "audio sample duration",
            )?,
            sample_size: u32::try_from(sample.au.len())
                .map_err(|e| GeneratePartError::TryFromInt("audio sample size", e))?,
        });
    }

    let first_pts = samples.first().map_or(muxer_start_time, |s| s.pts);
    let base_media_decode_time = try_u64(
        nanos_to_timescale(first_pts - muxer_start_time, timescale),
        "audio base media decode time",
    )?;

    Ok(Boxes::new(Mp4Box::Traf).with_children(vec![
        Boxes::new(Mp4Box::Tfhd { track_id }),
        Boxes::new(Mp4Box::Tfdt {
            base_media_decode_time,
        }),
        Boxes::new(Mp4Box::Trun {
            flags: TRUN_DATA_OFFSET_PRESENT
                | TRUN_SAMPLE_DURATION_PRESENT
                | TRUN_SAMPLE_SIZE_PRESENT,
            data_offset,
            entries: TrunEntries::V0(entries),
        }),
    ]))
}

/// Partial segment under construction. Samples are buffered until the
/// segment cuts the part, at which point they are rendered and released.
pub(crate) struct MuxerPart {
    pub(crate) id: u64,
    video_track: bool,
    is_independent: bool,
    video_samples: Vec<VideoSample>,
    audio_samples: Vec<AudioSample>,
}

impl MuxerPart {
    pub(crate) fn new(id: u64, video_track: bool) -> Self {
        Self {
            id,
            video_track,
            // Without a video track there is nothing to decode against.
            is_independent: !video_track,
            video_samples: Vec::new(),
            audio_samples: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.video_samples.is_empty() && self.audio_samples.is_empty()
    }

    pub(crate) fn duration(&self) -> i64 {
        if self.video_track {
            self.video_samples.iter().map(VideoSample::duration).sum()
        } else {
            self.audio_samples.iter().map(AudioSample::duration).sum()
        }
    }

    pub(crate) fn write_video(&mut self, sample: VideoSample) {
        if sample.idr_present {
            self.is_independent = true;
        }
        self.video_samples.push(sample);
    }

    pub(crate) fn write_audio(&mut self, sample: AudioSample) {
        self.audio_samples.push(sample);
    }

    pub(crate) fn finalize(
        self,
        muxer_start_time: i64,
        audio_timescale: Option<u32>,
    ) -> Result<PartFinalized, GeneratePartError> {
        let rendered_duration = self.duration();
        let rendered_content = generate_part(
            muxer_start_time,
            self.video_track,
            audio_timescale,
            &self.video_samples,
            &self.audio_samples,
        )?;

        Ok(PartFinalized {
            id: self.id,
            is_independent: self.is_independent,
            rendered_content,
            rendered_duration,
        })
    }
}

/// Rendered partial segment. Immutable once published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartFinalized {
    pub(crate) id: u64,
    pub(crate) is_independent: bool,
    pub(crate) rendered_content: Bytes,
    pub(crate) rendered_duration: i64,
}

impl PartFinalized {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> String {
        part_name(self.id)
    }

    pub fn is_independent(&self) -> bool {
        self.is_independent
    }

    pub fn content(&self) -> &Bytes {
        &self.rendered_content
    }

    /// Duration in nanoseconds.
    pub fn duration(&self) -> i64 {
        self.rendered_duration
    }
}

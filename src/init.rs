//! Initialization segment generation.

use crate::error::CreateInitError;
use crate::mp4::{Boxes, Mp4Box};
use crate::types::{StreamInfo, MOVIE_TIMESCALE, VIDEO_TIMESCALE, VIDEO_TRACK_ID};
use bytes::Bytes;

/// Build the `ftyp`+`moov` init segment. Pure function of the stream info;
/// identical input yields identical bytes.
pub(crate) fn generate_init(info: &StreamInfo) -> Result<Bytes, CreateInitError> {
    /*
       - ftyp
       - moov
         - mvhd
         - trak (video)
         - trak (audio)
         - mvex
           - trex (video)
           - trex (audio)
    */

    let ftyp = Boxes::new(Mp4Box::Ftyp {
        major_brand: *b"mp42",
        minor_version: 1,
        compatible_brands: vec![*b"mp41", *b"mp42", *b"isom", *b"hlsf"],
    });

    let mut moov = Boxes::new(Mp4Box::Moov).with_child(Boxes::new(Mp4Box::Mvhd {
        timescale: MOVIE_TIMESCALE,
        next_track_id: 2,
    }));

    let audio_track_id = if info.video_track_exist {
        2
    } else {
        VIDEO_TRACK_ID
    };

    if info.video_track_exist {
        moov.children.push(generate_video_trak(info)?);
    }
    if info.audio_track_exist {
        moov.children.push(generate_audio_trak(info, audio_track_id));
    }

    let mut mvex = Boxes::new(Mp4Box::Mvex);
    if info.video_track_exist {
        mvex.children.push(Boxes::new(Mp4Box::Trex {
            track_id: VIDEO_TRACK_ID,
        }));
    }
    if info.audio_track_exist {
        mvex.children.push(Boxes::new(Mp4Box::Trex {
            track_id: audio_track_id,
        }));
    }
    moov.children.push(mvex);

    let mut buf = Vec::with_capacity(ftyp.size() + moov.size());
    ftyp.marshal(&mut buf);
    moov.marshal(&mut buf);

    Ok(Bytes::from(buf))
}

fn generate_dinf() -> Boxes {
    Boxes::new(Mp4Box::Dinf)
        .with_child(Boxes::new(Mp4Box::Dref { entry_count: 1 }).with_child(Boxes::new(Mp4Box::Url)))
}

fn generate_video_trak(info: &StreamInfo) -> Result<Boxes, CreateInitError> {
    /*
       trak
       - tkhd
       - mdia
         - mdhd
         - hdlr
         - minf
           - vmhd
           - dinf
           - stbl
             - stsd
               - avc1
                 - avcC
                 - btrt
             - stts
             - stsc
             - stsz
             - stco
    */

    let sps = &info.video_sps;
    if sps.len() < 4 {
        return Err(CreateInitError::ParseSps(sps.len()));
    }

    let stbl = Boxes::new(Mp4Box::Stbl).with_children(vec![
        Boxes::new(Mp4Box::Stsd { entry_count: 1 }).with_child(
            Boxes::new(Mp4Box::Avc1 {
                width: info.video_width,
                height: info.video_height,
            })
            .with_children(vec![
                Boxes::new(Mp4Box::AvcC {
                    profile: sps[1],
                    profile_compatibility: sps[2],
                    level: sps[3],
                    sps: sps.clone(),
                    pps: info.video_pps.clone(),
                }),
                Boxes::new(Mp4Box::Btrt {
                    max_bitrate: 1_000_000,
                    avg_bitrate: 1_000_000,
                }),
            ]),
        ),
        Boxes::new(Mp4Box::Stts),
        Boxes::new(Mp4Box::Stsc),
        Boxes::new(Mp4Box::Stsz),
        Boxes::new(Mp4Box::Stco),
    ]);

    let minf = Boxes::new(Mp4Box::Minf).with_children(vec![
        Boxes::new(Mp4Box::Vmhd),
        generate_dinf(),
        stbl,
    ]);

    Ok(Boxes::new(Mp4Box::Trak).with_children(vec![
        Boxes::new(Mp4Box::Tkhd {
            track_id: VIDEO_TRACK_ID,
            alternate_group: 0,
            volume: 0,
            width: u32::from(info.video_width) * 65536,
            height: u32::from(info.video_height) * 65536,
        }),
        Boxes::new(Mp4Box::Mdia).with_children(vec![
            Boxes::new(Mp4Box::Mdhd {
                timescale: VIDEO_TIMESCALE,
            }),
            Boxes::new(Mp4Box::Hdlr {
                handler_type: *b"vide",
                name: "VideoHandler",
            }),
            minf,
        ]),
    ]))
}

fn generate_audio_trak(info: &StreamInfo, track_id: u32) -> Boxes {
    let stbl = Boxes::new(Mp4Box::Stbl).with_children(vec![
        Boxes::new(Mp4Box::Stsd { entry_count: 1 }).with_child(
            Boxes::new(Mp4Box::Mp4a {
                channel_count: info.audio_channel_count,
                sample_rate: (u64::from(info.audio_clock_rate) * 65536) as u32,
            })
            .with_children(vec![
                Boxes::new(Mp4Box::Esds {
                    config: info.audio_track_config.clone(),
                }),
                Boxes::new(Mp4Box::Btrt {
                    max_bitrate: 128_825,
                    avg_bitrate: 128_825,
                }),
            ]),
        ),
        Boxes::new(Mp4Box::Stts),
        Boxes::new(Mp4Box::Stsc),
        Boxes::new(Mp4Box::Stsz),
        Boxes::new(Mp4Box::Stco),
    ]);

    let minf = Boxes::new(Mp4Box::Minf).with_children(vec![
        Boxes::new(Mp4Box::Smhd),
        generate_dinf(),
        stbl,
    ]);

    Boxes::new(Mp4Box::Trak).with_children(vec![
        Boxes::new(Mp4Box::Tkhd {
            track_id,
            alternate_group: 1,
            volume: 0x0100,
            width: 0,
            height: 0,
        }),
        Boxes::new(Mp4Box::Mdia).with_children(vec![
            Boxes::new(Mp4Box::Mdhd {
                timescale: info.audio_clock_rate,
            }),
            Boxes::new(Mp4Box::Hdlr {
                handler_type: *b"soun",
                name: "SoundHandler",
            }),
            minf,
        ]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use pretty_hex::pretty_hex;

    fn test_info() -> StreamInfo {
        StreamInfo {
            video_track_exist: true,
            video_sps: Bytes::from_static(&[
                0x67, 0x64, 0x00, 0x16, 0xac, 0xd9, 0x40, 0xa4, 0x3b, 0xe4, 0x88, 0xc0, 0x44,
                0x00, 0x00, 0x03, 0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0x60, 0x3c, 0x58, 0xb6,
                0x58,
            ]),
            video_pps: Bytes::from_static(&[0x08]),
            video_width: 650,
            video_height: 450,
            audio_track_exist: true,
            audio_track_config: Bytes::from_static(&[0x12, 0x10]),
            audio_channel_count: 1,
            audio_clock_rate: 44100,
            audio_type: 2,
        }
    }

    #[test]
    fn test_generate_init_sps_too_short() {
        let info = StreamInfo {
            video_track_exist: true,
            video_sps: Bytes::from_static(&[0x67, 0x64]),
            ..StreamInfo::default()
        };
        assert_eq!(Err(CreateInitError::ParseSps(2)), generate_init(&info));
    }

    #[test]
    fn test_generate_init_idempotent() {
        let info = test_info();
        assert_eq!(generate_init(&info).unwrap(), generate_init(&info).unwrap());
    }

    #[test]
    #[allow(clippy::too_many_lines)]
    fn test_generate_init() {
        let got = generate_init(&test_info()).unwrap();

        let want = vec![
            0, 0, 0, 0x20, b'f', b't', b'y', b'p', //
            b'm', b'p', b'4', b'2', // Major brand.
            0, 0, 0, 1, // Minor version.
            b'm', b'p', b'4', b'1', // Compatible brand.
            b'm', b'p', b'4', b'2', // Compatible brand.
            b'i', b's', b'o', b'm', // Compatible brand.
            b'h', b'l', b's', b'f', // Compatible brand.
            0, 0, 4, 0x66, b'm', b'o', b'o', b'v', //
            0, 0, 0, 0x6c, b'm', b'v', b'h', b'd', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Creation time.
            0, 0, 0, 0, // Modification time.
            0, 0, 3, 0xe8, // Time scale.
            0, 0, 0, 0, // Duration.
            0, 1, 0, 0, // Rate.
            1, 0, // Volume.
            0, 0, // Reserved.
            0, 0, 0, 0, 0, 0, 0, 0, // Reserved2.
            0, 1, 0, 0, // 1 Matrix.
            0, 0, 0, 0, // 2.
            0, 0, 0, 0, // 3.
            0, 0, 0, 0, // 4.
            0, 1, 0, 0, // 5.
            0, 0, 0, 0, // 6.
            0, 0, 0, 0, // 7.
            0, 0, 0, 0, // 8.
            0x40, 0, 0, 0, // 9.
            0, 0, 0, 0, // 1 Predefined.
            0, 0, 0, 0, // 2.
            0, 0, 0, 0, // 3.
            0, 0, 0, 0, // 4.
            0, 0, 0, 0, // 5.
            0, 0, 0, 0, // 6.
            0, 0, 0, 2, // Next track ID.
            0, 0, 1, 0xee, b't', b'r', b'a', b'k', // Video.
            0, 0, 0, 0x5c, b't', b'k', b'h', b'd', //
            0, 0, 0, 3, // FullBox.
            0, 0, 0, 0, // Creation time.
            0, 0, 0, 0, // Modification time.
            0, 0, 0, 1, // Track ID.
            0, 0, 0, 0, // Reserved0.
            0, 0, 0, 0, // Duration.
            0, 0, 0, 0, 0, 0, 0, 0, // Reserved1.
            0, 0, // Layer.
            0, 0, // Alternate group.
            0, 0, // Volume.
            0, 0, // Reserved2.
            0, 1, 0, 0, // 1 Matrix.
            0, 0, 0, 0, // 2.
            0, 0, 0, 0, // 3.
            0, 0, 0, 0, // 4.
            0, 1, 0, 0, // 5.
            0, 0, 0, 0, // 6.
            0, 0, 0, 0, // 7.
            0, 0, 0, 0, // 8.
            0x40, 0, 0, 0, // 9.
            2, 0x8a, 0, 0, // Width.
            1, 0xc2, 0, 0, // Height.
            0, 0, 1, 0x8a, b'm', b'd', b'i', b'a', //
            0, 0, 0, 0x20, b'm', b'd', b'h', b'd', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Creation time.
            0, 0, 0, 0, // Modification time.
            0, 1, 0x5f, 0x90, // Time scale.
            0, 0, 0, 0, // Duration.
            0x55, 0xc4, // Language.
            0, 0, // Predefined.
            0, 0, 0, 0x2d, b'h', b'd', b'l', b'r', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Predefined.
            b'v', b'i', b'd', b'e', // Handler type.
            0, 0, 0, 0, // Reserved.
            0, 0, 0, 0, //
            0, 0, 0, 0, //
            b'V', b'i', b'd', b'e', b'o', b'H', b'a', b'n', b'd', b'l', b'e', b'r', 0, //
            0, 0, 1, 0x35, b'm', b'i', b'n', b'f', //
            0, 0, 0, 0x14, b'v', b'm', b'h', b'd', //
            0, 0, 0, 1, // FullBox.
            0, 0, // Graphics mode.
            0, 0, 0, 0, 0, 0, // OpColor.
            0, 0, 0, 0x24, b'd', b'i', b'n', b'f', //
            0, 0, 0, 0x1c, b'd', b'r', b'e', b'f', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 1, // Entry count.
            0, 0, 0, 0xc, b'u', b'r', b'l', b' ', //
            0, 0, 0, 1, // FullBox.
            0, 0, 0, 0xf5, b's', b't', b'b', b'l', //
            0, 0, 0, 0xa9, b's', b't', b's', b'd', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 1, // Entry count.
            0, 0, 0, 0x99, b'a', b'v', b'c', b'1', //
            0, 0, 0, 0, 0, 0, // Reserved.
            0, 1, // Data reference index.
            0, 0, // Predefined.
            0, 0, // Reserved.
            0, 0, 0, 0, // Predefined2.
            0, 0, 0, 0, 0, 0, 0, 0, 2, 0x8a, // Width.
            1, 0xc2, // Height.
            0, 0x48, 0, 0, // Horizresolution.
            0, 0x48, 0, 0, // Vertresolution.
            0, 0, 0, 0, // Reserved2.
            0, 1, // Frame count.
            0, 0, 0, 0, 0, 0, 0, 0, // Compressor name.
            0, 0, 0, 0, 0, 0, 0, 0, //
            0, 0, 0, 0, 0, 0, 0, 0, //
            0, 0, 0, 0, 0, 0, 0, 0, //
            0, 0x18, // Depth.
            0xff, 0xff, // Predefined3.
            0, 0, 0, 0x2f, b'a', b'v', b'c', b'C', //
            1,    // Configuration version.
            0x64, // Profile.
            0,    // Profile compatibility.
            0x16, // Level.
            0xff, // Reserved, length size minus one.
            0xe1, // Reserved, N sequence parameters.
            0, 0x1b, // Length 27.
            0x67, 0x64, 0, 0x16, 0xac, // Parameter set.
            0xd9, 0x40, 0xa4, 0x3b, 0xe4, //
            0x88, 0xc0, 0x44, 0, 0, //
            3, 0, 4, 0, 0, //
            3, 0, 0x60, 0x3c, 0x58, //
            0xb6, 0x58, //
            1, // N picture parameters.
            0, 1, // Length 1.
            0x08, // Parameter set.
            0, 0, 0, 0x14, b'b', b't', b'r', b't', //
            0, 0, 0, 0, // Buffer size.
            0, 0xf, 0x42, 0x40, // Max bitrate.
            0, 0xf, 0x42, 0x40, // Average bitrate.
            0, 0, 0, 0x10, b's', b't', b't', b's', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Entry count.
            0, 0, 0, 0x10, b's', b't', b's', b'c', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Entry count.
            0, 0, 0, 0x14, b's', b't', b's', b'z', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Sample size.
            0, 0, 0, 0, // Sample count.
            0, 0, 0, 0x10, b's', b't', b'c', b'o', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Entry count.
            0, 0, 1, 0xbc, b't', b'r', b'a', b'k', // Audio.
            0, 0, 0, 0x5c, b't', b'k', b'h', b'd', //
            0, 0, 0, 3, // FullBox.
            0, 0, 0, 0, // Creation time.
            0, 0, 0, 0, // Modification time.
            0, 0, 0, 2, // Track ID.
            0, 0, 0, 0, // Reserved0.
            0, 0, 0, 0, // Duration.
            0, 0, 0, 0, 0, 0, 0, 0, // Reserved1.
            0, 0, // Layer.
            0, 1, // Alternate group.
            1, 0, // Volume.
            0, 0, // Reserved2.
            0, 1, 0, 0, // 1 Matrix.
            0, 0, 0, 0, // 2.
            0, 0, 0, 0, // 3.
            0, 0, 0, 0, // 4.
            0, 1, 0, 0, // 5.
            0, 0, 0, 0, // 6.
            0, 0, 0, 0, // 7.
            0, 0, 0, 0, // 8.
            0x40, 0, 0, 0, // 9.
            0, 0, 0, 0, // Width.
            0, 0, 0, 0, // Height.
            0, 0, 1, 0x58, b'm', b'd', b'i', b'a', //
            0, 0, 0, 0x20, b'm', b'd', b'h', b'd', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Creation time.
            0, 0, 0, 0, // Modification time.
            0, 0, 0xac, 0x44, // Time scale.
            0, 0, 0, 0, // Duration.
            0x55, 0xc4, // Language.
            0, 0, // Predefined.
            0, 0, 0, 0x2d, b'h', b'd', b'l', b'r', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Predefined.
            b's', b'o', b'u', b'n', // Handler type.
            0, 0, 0, 0, // Reserved.
            0, 0, 0, 0, //
            0, 0, 0, 0, //
            b'S', b'o', b'u', b'n', b'd', b'H', b'a', b'n', b'd', b'l', b'e', b'r', 0, //
            0, 0, 1, 0x03, b'm', b'i', b'n', b'f', //
            0, 0, 0, 0x10, b's', b'm', b'h', b'd', //
            0, 0, 0, 0, // FullBox.
            0, 0, // Balance.
            0, 0, // Reserved.
            0, 0, 0, 0x24, b'd', b'i', b'n', b'f', //
            0, 0, 0, 0x1c, b'd', b'r', b'e', b'f', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 1, // Entry count.
            0, 0, 0, 0xc, b'u', b'r', b'l', b' ', //
            0, 0, 0, 1, // FullBox.
            0, 0, 0, 0xc7, b's', b't', b'b', b'l', //
            0, 0, 0, 0x7b, b's', b't', b's', b'd', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 1, // Entry count.
            0, 0, 0, 0x6b, b'm', b'p', b'4', b'a', //
            0, 0, 0, 0, 0, 0, // Reserved.
            0, 1, // Data reference index.
            0, 0, 0, 0, 0, 0, 0, 0, // Reserved2.
            0, 1, // Channel count.
            0, 0x10, // Sample size.
            0, 0, // Predefined.
            0, 0, // Reserved3.
            0xac, 0x44, 0, 0, // Sample rate.
            0, 0, 0, 0x33, b'e', b's', b'd', b's', //
            0, 0, 0, 0, // FullBox.
            3, 0x80, 0x80, 0x80, 0x22, // ES_Descr.
            0, 0, // ES_ID.
            0, // Flags.
            4, 0x80, 0x80, 0x80, 0x14, // DecoderConfigDescr.
            0x40, // Object type indicator.
            0x15, // Stream type.
            0, 0, 0, // Buffer size DB.
            0, 1, 0xf7, 0x39, // Max bitrate.
            0, 1, 0xf7, 0x39, // Average bitrate.
            5, 0x80, 0x80, 0x80, 2, // DecSpecificInfo.
            0x12, 0x10, // Config.
            6, 0x80, 0x80, 0x80, 1, // SLConfigDescr.
            2, // MP4 file.
            0, 0, 0, 0x14, b'b', b't', b'r', b't', //
            0, 0, 0, 0, // Buffer size.
            0, 1, 0xf7, 0x39, // Max bitrate.
            0, 1, 0xf7, 0x39, // Average bitrate.
            0, 0, 0, 0x10, b's', b't', b't', b's', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Entry count.
            0, 0, 0, 0x10, b's', b't', b's', b'c', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Entry count.
            0, 0, 0, 0x14, b's', b't', b's', b'z', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Sample size.
            0, 0, 0, 0, // Sample count.
            0, 0, 0, 0x10, b's', b't', b'c', b'o', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Entry count.
            0, 0, 0, 0x48, b'm', b'v', b'e', b'x', //
            0, 0, 0, 0x20, b't', b'r', b'e', b'x', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 1, // Track ID.
            0, 0, 0, 1, // Default sample description index.
            0, 0, 0, 0, // Default sample duration.
            0, 0, 0, 0, // Default sample size.
            0, 0, 0, 0, // Default sample flags.
            0, 0, 0, 0x20, b't', b'r', b'e', b'x', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 2, // Track ID.
            0, 0, 0, 1, // Default sample description index.
            0, 0, 0, 0, // Default sample duration.
            0, 0, 0, 0, // Default sample size.
            0, 0, 0, 0, // Default sample flags.
        ];
        if want != got {
            assert_eq!(pretty_hex(&want), pretty_hex(&got));
        }
    }
}

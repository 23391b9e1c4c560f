//! ISO base media file format box serialization.
//!
//! Only the subset of boxes needed for fMP4 init segments and parts is
//! covered. Every box is a variant of [`Mp4Box`] owning exactly the fields
//! that vary between uses; constant fields are written by the marshaller.

use bytes::{BufMut, Bytes};

pub const TRUN_DATA_OFFSET_PRESENT: u32 = 0x01;
pub const TRUN_SAMPLE_DURATION_PRESENT: u32 = 0x100;
pub const TRUN_SAMPLE_SIZE_PRESENT: u32 = 0x200;
pub const TRUN_SAMPLE_FLAGS_PRESENT: u32 = 0x400;
pub const TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT: u32 = 0x800;

/// `sample_is_non_sync_sample` in the trun sample flags.
pub const SAMPLE_FLAG_NON_SYNC: u32 = 1 << 16;

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

// ISO 639-2 "und", packed 5 bits per letter.
const LANGUAGE_UND: u16 = 0x55C4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrunEntryV0 {
    pub sample_duration: u32,
    pub sample_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrunEntryV1 {
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_flags: u32,
    pub sample_composition_time_offset: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrunEntries {
    V0(Vec<TrunEntryV0>),
    V1(Vec<TrunEntryV1>),
}

impl TrunEntries {
    fn len(&self) -> usize {
        match self {
            TrunEntries::V0(entries) => entries.len(),
            TrunEntries::V1(entries) => entries.len(),
        }
    }

    fn entry_size(&self) -> usize {
        match self {
            TrunEntries::V0(_) => 8,
            TrunEntries::V1(_) => 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mp4Box {
    Ftyp {
        major_brand: [u8; 4],
        minor_version: u32,
        compatible_brands: Vec<[u8; 4]>,
    },
    Moov,
    Mvhd {
        timescale: u32,
        next_track_id: u32,
    },
    Trak,
    Tkhd {
        track_id: u32,
        alternate_group: u16,
        volume: u16,
        width: u32,
        height: u32,
    },
    Mdia,
    Mdhd {
        timescale: u32,
    },
    Hdlr {
        handler_type: [u8; 4],
        name: &'static str,
    },
    Minf,
    Vmhd,
    Smhd,
    Dinf,
    Dref {
        entry_count: u32,
    },
    Url,
    Stbl,
    Stsd {
        entry_count: u32,
    },
    Avc1 {
        width: u16,
        height: u16,
    },
    AvcC {
        profile: u8,
        profile_compatibility: u8,
        level: u8,
        sps: Bytes,
        pps: Bytes,
    },
    Btrt {
        max_bitrate: u32,
        avg_bitrate: u32,
    },
    Stts,
    Stsc,
    Stsz,
    Stco,
    Mp4a {
        channel_count: u16,
        sample_rate: u32,
    },
    Esds {
        config: Bytes,
    },
    Mvex,
    Trex {
        track_id: u32,
    },
    Moof,
    Mfhd {
        sequence_number: u32,
    },
    Traf,
    Tfhd {
        track_id: u32,
    },
    Tfdt {
        base_media_decode_time: u64,
    },
    Trun {
        flags: u32,
        data_offset: i32,
        entries: TrunEntries,
    },
    Mdat {
        payload: Vec<Bytes>,
    },
}

/// A box together with its ordered children. Trees are strictly downward;
/// parents never need to be reachable from a child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Boxes {
    pub data: Mp4Box,
    pub children: Vec<Boxes>,
}

impl Boxes {
    pub fn new(data: Mp4Box) -> Self {
        Self {
            data,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<Boxes>) -> Self {
        self.children = children;
        self
    }

    pub fn with_child(mut self, child: Boxes) -> Self {
        self.children.push(child);
        self
    }

    /// Total marshalled size, including the 8-byte header and all children.
    pub fn size(&self) -> usize {
        8 + self.data.payload_size() + self.children.iter().map(Boxes::size).sum::<usize>()
    }

    pub fn marshal(&self, buf: &mut Vec<u8>) {
        buf.put_u32(self.size() as u32);
        buf.put_slice(&self.data.box_type());
        self.data.marshal_payload(buf);
        for child in &self.children {
            child.marshal(buf);
        }
    }
}

impl Mp4Box {
    pub fn box_type(&self) -> [u8; 4] {
        match self {
            Mp4Box::Ftyp { .. } => *b"ftyp",
            Mp4Box::Moov => *b"moov",
            Mp4Box::Mvhd { .. } => *b"mvhd",
            Mp4Box::Trak => *b"trak",
            Mp4Box::Tkhd { .. } => *b"tkhd",
            Mp4Box::Mdia => *b"mdia",
            Mp4Box::Mdhd { .. } => *b"mdhd",
            Mp4Box::Hdlr { .. } => *b"hdlr",
            Mp4Box::Minf => *b"minf",
            Mp4Box::Vmhd => *b"vmhd",
            Mp4Box::Smhd => *b"smhd",
            Mp4Box::Dinf => *b"dinf",
            Mp4Box::Dref { .. } => *b"dref",
            Mp4Box::Url => *b"url ",
            Mp4Box::Stbl => *b"stbl",
            Mp4Box::Stsd { .. } => *b"stsd",
            Mp4Box::Avc1 { .. } => *b"avc1",
            Mp4Box::AvcC { .. } => *b"avcC",
            Mp4Box::Btrt { .. } => *b"btrt",
            Mp4Box::Stts => *b"stts",
            Mp4Box::Stsc => *b"stsc",
            Mp4Box::Stsz => *b"stsz",
            Mp4Box::Stco => *b"stco",
            Mp4Box::Mp4a { .. } => *b"mp4a",
            Mp4Box::Esds { .. } => *b"esds",
            Mp4Box::Mvex => *b"mvex",
            Mp4Box::Trex { .. } => *b"trex",
            Mp4Box::Moof => *b"moof",
            Mp4Box::Mfhd { .. } => *b"mfhd",
            Mp4Box::Traf => *b"traf",
            Mp4Box::Tfhd { .. } => *b"tfhd",
            Mp4Box::Tfdt { .. } => *b"tfdt",
            Mp4Box::Trun { .. } => *b"trun",
            Mp4Box::Mdat { .. } => *b"mdat",
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Mp4Box::Ftyp {
                compatible_brands, ..
            } => 8 + compatible_brands.len() * 4,
            Mp4Box::Moov
            | Mp4Box::Trak
            | Mp4Box::Mdia
            | Mp4Box::Minf
            | Mp4Box::Dinf
            | Mp4Box::Stbl
            | Mp4Box::Mvex
            | Mp4Box::Moof
            | Mp4Box::Traf => 0,
            Mp4Box::Mvhd { .. } => 100,
            Mp4Box::Tkhd { .. } => 84,
            Mp4Box::Mdhd { .. } => 24,
            Mp4Box::Hdlr { name, .. } => 25 + name.len(),
            Mp4Box::Vmhd => 12,
            Mp4Box::Smhd => 8,
            Mp4Box::Dref { .. } => 8,
            Mp4Box::Url => 4,
            Mp4Box::Stsd { .. } => 8,
            Mp4Box::Avc1 { .. } => 78,
            Mp4Box::AvcC { sps, pps, .. } => 8 + sps.len() + 3 + pps.len(),
            Mp4Box::Btrt { .. } => 12,
            Mp4Box::Stts | Mp4Box::Stsc | Mp4Box::Stco => 8,
            Mp4Box::Stsz => 12,
            Mp4Box::Mp4a { .. } => 28,
            Mp4Box::Esds { config } => 41 + config.len(),
            Mp4Box::Trex { .. } => 24,
            Mp4Box::Mfhd { .. } => 8,
            Mp4Box::Tfhd { .. } => 8,
            Mp4Box::Tfdt { .. } => 12,
            Mp4Box::Trun { entries, .. } => 12 + entries.len() * entries.entry_size(),
            Mp4Box::Mdat { payload } => payload.iter().map(Bytes::len).sum(),
        }
    }

    fn marshal_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Mp4Box::Ftyp {
                major_brand,
                minor_version,
                compatible_brands,
            } => {
                buf.put_slice(major_brand);
                buf.put_u32(*minor_version);
                for brand in compatible_brands {
                    buf.put_slice(brand);
                }
            }
            Mp4Box::Moov
            | Mp4Box::Trak
            | Mp4Box::Mdia
            | Mp4Box::Minf
            | Mp4Box::Dinf
            | Mp4Box::Stbl
            | Mp4Box::Mvex
            | Mp4Box::Moof
            | Mp4Box::Traf => {}
            Mp4Box::Mvhd {
                timescale,
                next_track_id,
            } => {
                buf.put_u32(0); // FullBox.
                buf.put_u32(0); // Creation time.
                buf.put_u32(0); // Modification time.
                buf.put_u32(*timescale);
                buf.put_u32(0); // Duration.
                buf.put_u32(0x0001_0000); // Rate.
                buf.put_u16(0x0100); // Volume.
                buf.put_u16(0); // Reserved.
                buf.put_slice(&[0; 8]); // Reserved2.
                for v in UNITY_MATRIX {
                    buf.put_u32(v);
                }
                buf.put_slice(&[0; 24]); // Predefined.
                buf.put_u32(*next_track_id);
            }
            Mp4Box::Tkhd {
                track_id,
                alternate_group,
                volume,
                width,
                height,
            } => {
                buf.put_u32(3); // FullBox, track enabled and in movie.
                buf.put_u32(0); // Creation time.
                buf.put_u32(0); // Modification time.
                buf.put_u32(*track_id);
                buf.put_u32(0); // Reserved0.
                buf.put_u32(0); // Duration.
                buf.put_slice(&[0; 8]); // Reserved1.
                buf.put_u16(0); // Layer.
                buf.put_u16(*alternate_group);
                buf.put_u16(*volume);
                buf.put_u16(0); // Reserved2.
                for v in UNITY_MATRIX {
                    buf.put_u32(v);
                }
                buf.put_u32(*width);
                buf.put_u32(*height);
            }
            Mp4Box::Mdhd { timescale } => {
                buf.put_u32(0); // FullBox.
                buf.put_u32(0); // Creation time.
                buf.put_u32(0); // Modification time.
                buf.put_u32(*timescale);
                buf.put_u32(0); // Duration.
                buf.put_u16(LANGUAGE_UND);
                buf.put_u16(0); // Predefined.
            }
            Mp4Box::Hdlr { handler_type, name } => {
                buf.put_u32(0); // FullBox.
                buf.put_u32(0); // Predefined.
                buf.put_slice(handler_type);
                buf.put_slice(&[0; 12]); // Reserved.
                buf.put_slice(name.as_bytes());
                buf.put_u8(0);
            }
            Mp4Box::Vmhd => {
                buf.put_u32(1); // FullBox, no lean ahead.
                buf.put_u16(0); // Graphics mode.
                buf.put_slice(&[0; 6]); // OpColor.
            }
            Mp4Box::Smhd => {
                buf.put_u32(0); // FullBox.
                buf.put_u16(0); // Balance.
                buf.put_u16(0); // Reserved.
            }
            Mp4Box::Dref { entry_count } => {
                buf.put_u32(0); // FullBox.
                buf.put_u32(*entry_count);
            }
            Mp4Box::Url => {
                buf.put_u32(1); // FullBox, media data in the same file.
            }
            Mp4Box::Stsd { entry_count } => {
                buf.put_u32(0); // FullBox.
                buf.put_u32(*entry_count);
            }
            Mp4Box::Avc1 { width, height } => {
                buf.put_slice(&[0; 6]); // Reserved.
                buf.put_u16(1); // Data reference index.
                buf.put_u16(0); // Predefined.
                buf.put_u16(0); // Reserved.
                buf.put_slice(&[0; 12]); // Predefined2.
                buf.put_u16(*width);
                buf.put_u16(*height);
                buf.put_u32(0x0048_0000); // Horizresolution.
                buf.put_u32(0x0048_0000); // Vertresolution.
                buf.put_u32(0); // Reserved2.
                buf.put_u16(1); // Frame count.
                buf.put_slice(&[0; 32]); // Compressor name.
                buf.put_u16(24); // Depth.
                buf.put_i16(-1); // Predefined3.
            }
            Mp4Box::AvcC {
                profile,
                profile_compatibility,
                level,
                sps,
                pps,
            } => {
                buf.put_u8(1); // Configuration version.
                buf.put_u8(*profile);
                buf.put_u8(*profile_compatibility);
                buf.put_u8(*level);
                buf.put_u8(0xFC | 3); // Reserved, length size minus one.
                buf.put_u8(0xE0 | 1); // Reserved, one sequence parameter set.
                buf.put_u16(sps.len() as u16);
                buf.put_slice(sps);
                buf.put_u8(1); // One picture parameter set.
                buf.put_u16(pps.len() as u16);
                buf.put_slice(pps);
            }
            Mp4Box::Btrt {
                max_bitrate,
                avg_bitrate,
            } => {
                buf.put_u32(0); // Buffer size.
                buf.put_u32(*max_bitrate);
                buf.put_u32(*avg_bitrate);
            }
            Mp4Box::Stts | Mp4Box::Stsc | Mp4Box::Stco => {
                buf.put_u32(0); // FullBox.
                buf.put_u32(0); // Entry count.
            }
            Mp4Box::Stsz => {
                buf.put_u32(0); // FullBox.
                buf.put_u32(0); // Sample size.
                buf.put_u32(0); // Sample count.
            }
            Mp4Box::Mp4a {
                channel_count,
                sample_rate,
            } => {
                buf.put_slice(&[0; 6]); // Reserved.
                buf.put_u16(1); // Data reference index.
                buf.put_slice(&[0; 8]); // Reserved2.
                buf.put_u16(*channel_count);
                buf.put_u16(16); // Sample size.
                buf.put_u16(0); // Predefined.
                buf.put_u16(0); // Reserved3.
                buf.put_u32(*sample_rate);
            }
            Mp4Box::Esds { config } => marshal_esds(buf, config),
            Mp4Box::Trex { track_id } => {
                buf.put_u32(0); // FullBox.
                buf.put_u32(*track_id);
                buf.put_u32(1); // Default sample description index.
                buf.put_u32(0); // Default sample duration.
                buf.put_u32(0); // Default sample size.
                buf.put_u32(0); // Default sample flags.
            }
            Mp4Box::Mfhd { sequence_number } => {
                buf.put_u32(0); // FullBox.
                buf.put_u32(*sequence_number);
            }
            Mp4Box::Tfhd { track_id } => {
                buf.put_u32(0x0002_0000); // FullBox, default-base-is-moof.
                buf.put_u32(*track_id);
            }
            Mp4Box::Tfdt {
                base_media_decode_time,
            } => {
                buf.put_u8(1); // Version.
                buf.put_slice(&[0; 3]); // Flags.
                buf.put_u64(*base_media_decode_time);
            }
            Mp4Box::Trun {
                flags,
                data_offset,
                entries,
            } => {
                let version = match entries {
                    TrunEntries::V0(_) => 0,
                    TrunEntries::V1(_) => 1,
                };
                buf.put_u8(version);
                buf.put_u8((flags >> 16) as u8);
                buf.put_u8((flags >> 8) as u8);
                buf.put_u8(*flags as u8);
                buf.put_u32(entries.len() as u32);
                buf.put_i32(*data_offset);
                match entries {
                    TrunEntries::V0(entries) => {
                        for entry in entries {
                            buf.put_u32(entry.sample_duration);
                            buf.put_u32(entry.sample_size);
                        }
                    }
                    TrunEntries::V1(entries) => {
                        for entry in entries {
                            buf.put_u32(entry.sample_duration);
                            buf.put_u32(entry.sample_size);
                            buf.put_u32(entry.sample_flags);
                            buf.put_i32(entry.sample_composition_time_offset);
                        }
                    }
                }
            }
            Mp4Box::Mdat { payload } => {
                for chunk in payload {
                    buf.put_slice(chunk);
                }
            }
        }
    }
}

/// MPEG-4 elementary stream descriptor chain, 14496-1 7.2.6.
fn marshal_esds(buf: &mut Vec<u8>, config: &[u8]) {
    let n = config.len() as u8;

    buf.put_u32(0); // FullBox.

    buf.put_u8(0x03); // ES_Descr tag.
    put_descriptor_len(buf, 32 + n);
    buf.put_u16(0); // ES_ID.
    buf.put_u8(0); // Flags.

    buf.put_u8(0x04); // DecoderConfigDescr tag.
    put_descriptor_len(buf, 18 + n);
    buf.put_u8(0x40); // Object type indicator, MPEG-4 Audio.
    buf.put_u8(0x15); // Stream type, audio.
    buf.put_slice(&[0; 3]); // Buffer size DB.
    buf.put_u32(0x0001_F739); // Max bitrate.
    buf.put_u32(0x0001_F739); // Average bitrate.

    buf.put_u8(0x05); // DecSpecificInfo tag.
    put_descriptor_len(buf, n);
    buf.put_slice(config);

    buf.put_u8(0x06); // SLConfigDescr tag.
    put_descriptor_len(buf, 1);
    buf.put_u8(0x02); // MP4 file.
}

fn put_descriptor_len(buf: &mut Vec<u8>, len: u8) {
    buf.put_slice(&[0x80, 0x80, 0x80]);
    buf.put_u8(len);
}

//! ISO BMFF box builders
//!
//! Each builder returns a complete box (size + fourcc + payload). Only the
//! subset needed for a two-track progressive MP4 is covered.

pub fn make_box(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(8 + payload.len());
    v.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
    v.extend_from_slice(typ);
    v.extend_from_slice(payload);
    v
}

/// Concatenate already-built child boxes into a container box
pub fn container(typ: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = children.concat();
    make_box(typ, &payload)
}

fn full_box_header(buf: &mut Vec<u8>, version: u8, flags: u32) {
    be_u32(buf, ((version as u32) << 24) | (flags & 0x00FF_FFFF));
}

pub fn be_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn be_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn be_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn zeroes(buf: &mut Vec<u8>, n: usize) {
    buf.resize(buf.len() + n, 0);
}

fn unity_matrix(buf: &mut Vec<u8>) {
    for v in [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        be_u32(buf, v);
    }
}

pub fn ftyp() -> Vec<u8> {
    let mut payload = Vec::with_capacity(24);
    payload.extend_from_slice(b"isom");
    be_u32(&mut payload, 512);
    for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
        payload.extend_from_slice(brand);
    }
    make_box(b"ftyp", &payload)
}

/// `mdat` header for a payload of `len` bytes; 16 bytes when a large size is needed
pub fn mdat_header(len: u64) -> Vec<u8> {
    let mut header = Vec::with_capacity(16);
    if len + 8 <= u32::MAX as u64 {
        be_u32(&mut header, (len + 8) as u32);
        header.extend_from_slice(b"mdat");
    } else {
        be_u32(&mut header, 1);
        header.extend_from_slice(b"mdat");
        be_u64(&mut header, len + 16);
    }
    header
}

pub fn mvhd(timescale: u32, duration: u32, next_track_id: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(100);
    full_box_header(&mut payload, 0, 0);
    zeroes(&mut payload, 8); // creation & modification time
    be_u32(&mut payload, timescale);
    be_u32(&mut payload, duration);
    be_u32(&mut payload, 0x0001_0000); // rate 1.0
    be_u16(&mut payload, 0x0100); // volume 1.0
    zeroes(&mut payload, 10);
    unity_matrix(&mut payload);
    zeroes(&mut payload, 24); // pre_defined
    be_u32(&mut payload, next_track_id);
    make_box(b"mvhd", &payload)
}

pub fn tkhd(track_id: u32, duration: u32, width: u32, height: u32, is_audio: bool) -> Vec<u8> {
    let mut payload = Vec::with_capacity(84);
    full_box_header(&mut payload, 0, 0x0000_0003); // enabled | in_movie
    zeroes(&mut payload, 8);
    be_u32(&mut payload, track_id);
    be_u32(&mut payload, 0);
    be_u32(&mut payload, duration);
    zeroes(&mut payload, 8);
    be_u16(&mut payload, 0); // layer
    be_u16(&mut payload, 0); // alternate group
    be_u16(&mut payload, if is_audio { 0x0100 } else { 0 });
    be_u16(&mut payload, 0);
    unity_matrix(&mut payload);
    be_u32(&mut payload, width << 16);
    be_u32(&mut payload, height << 16);
    make_box(b"tkhd", &payload)
}

pub fn mdhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(24);
    full_box_header(&mut payload, 0, 0);
    zeroes(&mut payload, 8);
    be_u32(&mut payload, timescale);
    be_u32(&mut payload, duration);
    be_u16(&mut payload, 0x55C4); // language "und"
    be_u16(&mut payload, 0);
    make_box(b"mdhd", &payload)
}

pub fn hdlr(handler: &[u8; 4], name: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(25 + name.len());
    full_box_header(&mut payload, 0, 0);
    be_u32(&mut payload, 0);
    payload.extend_from_slice(handler);
    zeroes(&mut payload, 12);
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    make_box(b"hdlr", &payload)
}

pub fn vmhd() -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    full_box_header(&mut payload, 0, 1);
    zeroes(&mut payload, 8); // graphics mode + opcolor
    make_box(b"vmhd", &payload)
}

pub fn smhd() -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    full_box_header(&mut payload, 0, 0);
    zeroes(&mut payload, 4); // balance + reserved
    make_box(b"smhd", &payload)
}

pub fn dinf() -> Vec<u8> {
    let mut url = Vec::with_capacity(4);
    full_box_header(&mut url, 0, 1); // self-contained
    let url = make_box(b"url ", &url);

    let mut dref = Vec::with_capacity(8 + url.len());
    full_box_header(&mut dref, 0, 0);
    be_u32(&mut dref, 1);
    dref.extend_from_slice(&url);

    make_box(b"dinf", &make_box(b"dref", &dref))
}

fn stsd(entry: Vec<u8>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + entry.len());
    full_box_header(&mut payload, 0, 0);
    be_u32(&mut payload, 1);
    payload.extend_from_slice(&entry);
    make_box(b"stsd", &payload)
}

/// `stsd` with an `avc1` entry carrying the given avcC payload
pub fn stsd_avc1(width: u32, height: u32, avcc: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(86 + avcc.len());
    zeroes(&mut payload, 6);
    be_u16(&mut payload, 1); // data_reference_index
    zeroes(&mut payload, 16); // pre_defined + reserved
    be_u16(&mut payload, width as u16);
    be_u16(&mut payload, height as u16);
    be_u32(&mut payload, 0x0048_0000); // 72 dpi
    be_u32(&mut payload, 0x0048_0000);
    be_u32(&mut payload, 0);
    be_u16(&mut payload, 1); // frame_count
    zeroes(&mut payload, 32); // compressor name
    be_u16(&mut payload, 0x0018); // depth
    be_u16(&mut payload, 0xFFFF);
    payload.extend_from_slice(&make_box(b"avcC", avcc));
    stsd(make_box(b"avc1", &payload))
}

/// `stsd` with an `mp4a` entry carrying the given AudioSpecificConfig
pub fn stsd_mp4a(channels: u16, sample_rate: u32, asc: &[u8], bitrate: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + asc.len());
    zeroes(&mut payload, 6);
    be_u16(&mut payload, 1);
    zeroes(&mut payload, 8);
    be_u16(&mut payload, channels);
    be_u16(&mut payload, 16); // sample size
    zeroes(&mut payload, 4);
    be_u32(&mut payload, sample_rate.min(0xFFFF) << 16);
    payload.extend_from_slice(&esds(asc, bitrate));
    stsd(make_box(b"mp4a", &payload))
}

fn esds(asc: &[u8], bitrate: u32) -> Vec<u8> {
    let dec_config_len = 13 + 2 + asc.len();
    let es_len = 3 + (2 + dec_config_len) + 3;

    let mut payload = Vec::with_capacity(4 + 2 + es_len);
    full_box_header(&mut payload, 0, 0);

    payload.push(0x03); // ES_Descriptor
    payload.push(es_len as u8);
    be_u16(&mut payload, 1); // ES_ID
    payload.push(0);

    payload.push(0x04); // DecoderConfigDescriptor
    payload.push(dec_config_len as u8);
    payload.push(0x40); // MPEG-4 audio
    payload.push(0x15); // audio stream
    zeroes(&mut payload, 3); // bufferSizeDB
    be_u32(&mut payload, bitrate);
    be_u32(&mut payload, bitrate);

    payload.push(0x05); // DecoderSpecificInfo
    payload.push(asc.len() as u8);
    payload.extend_from_slice(asc);

    payload.extend_from_slice(&[0x06, 0x01, 0x02]); // SLConfigDescriptor
    make_box(b"esds", &payload)
}

/// Run-length encoded decode deltas
pub fn stts(deltas: &[u32]) -> Vec<u8> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &delta in deltas {
        match runs.last_mut() {
            Some((count, d)) if *d == delta => *count += 1,
            _ => runs.push((1, delta)),
        }
    }

    let mut payload = Vec::with_capacity(8 + runs.len() * 8);
    full_box_header(&mut payload, 0, 0);
    be_u32(&mut payload, runs.len() as u32);
    for (count, delta) in runs {
        be_u32(&mut payload, count);
        be_u32(&mut payload, delta);
    }
    make_box(b"stts", &payload)
}

/// Sync sample table (1-based sample numbers)
pub fn stss(sync_samples: &[u32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + sync_samples.len() * 4);
    full_box_header(&mut payload, 0, 0);
    be_u32(&mut payload, sync_samples.len() as u32);
    for &n in sync_samples {
        be_u32(&mut payload, n);
    }
    make_box(b"stss", &payload)
}

/// Edit list delaying a track by `lead` movie ticks, then playing `media`
/// movie ticks of it from media time zero
pub fn edts(lead: u32, media: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32);
    full_box_header(&mut payload, 0, 0);
    be_u32(&mut payload, 2);
    // Empty edit
    be_u32(&mut payload, lead);
    be_u32(&mut payload, u32::MAX);
    be_u32(&mut payload, 0x0001_0000);
    be_u32(&mut payload, media);
    be_u32(&mut payload, 0);
    be_u32(&mut payload, 0x0001_0000);
    container(b"edts", &[make_box(b"elst", &payload)])
}

/// One sample per chunk
pub fn stsc_single() -> Vec<u8> {
    let mut payload = Vec::with_capacity(20);
    full_box_header(&mut payload, 0, 0);
    be_u32(&mut payload, 1);
    be_u32(&mut payload, 1); // first_chunk
    be_u32(&mut payload, 1); // samples_per_chunk
    be_u32(&mut payload, 1); // sample_description_index
    make_box(b"stsc", &payload)
}

pub fn stsz(sizes: &[u32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12 + sizes.len() * 4);
    full_box_header(&mut payload, 0, 0);
    be_u32(&mut payload, 0); // sizes follow
    be_u32(&mut payload, sizes.len() as u32);
    for &size in sizes {
        be_u32(&mut payload, size);
    }
    make_box(b"stsz", &payload)
}

/// Chunk offsets; `co64` when `wide`
pub fn chunk_offsets(offsets: &[u64], wide: bool) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + offsets.len() * if wide { 8 } else { 4 });
    full_box_header(&mut payload, 0, 0);
    be_u32(&mut payload, offsets.len() as u32);
    for &offset in offsets {
        if wide {
            be_u64(&mut payload, offset);
        } else {
            be_u32(&mut payload, offset as u32);
        }
    }
    make_box(if wide { b"co64" } else { b"stco" }, &payload)
}

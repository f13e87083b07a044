//! H.264 Annex-B and AAC ADTS bitstream helpers
//!
//! FFmpeg emits raw elementary streams on stdout. These helpers cut them into
//! access units / raw AAC frames and derive the out-of-band decoder
//! configuration the MP4 sample entries need.

pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// AAC frames always carry 1024 samples per channel
pub const AAC_FRAME_SAMPLES: u64 = 1024;

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

#[inline]
pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1F).unwrap_or(0)
}

fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    (from..data.len() - 2).find(|&i| data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1)
}

fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let end = nal.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
    &nal[..end]
}

/// Incremental Annex-B splitter.
///
/// Bytes may arrive in arbitrary pieces; a NAL unit is released once the next
/// start code is seen.
#[derive(Default)]
pub struct AnnexBSplitter {
    buf: Vec<u8>,
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut nals = Vec::new();

        let Some(first) = find_start_code(&self.buf, 0) else {
            return nals;
        };

        let mut start = first + 3;
        while let Some(next) = find_start_code(&self.buf, start) {
            let nal = trim_trailing_zeros(&self.buf[start..next]);
            if !nal.is_empty() {
                nals.push(nal.to_vec());
            }
            start = next + 3;
        }

        // Keep the start code of the unit still being received
        self.buf.drain(..start - 3);
        nals
    }

    /// Release the final unit at end of stream
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let buf = std::mem::take(&mut self.buf);
        let start = find_start_code(&buf, 0)? + 3;
        let nal = trim_trailing_zeros(&buf[start..]);
        (!nal.is_empty()).then(|| nal.to_vec())
    }
}

/// One coded picture
#[derive(Debug, Default, Clone)]
pub struct AccessUnit {
    pub nals: Vec<Vec<u8>>,
}

impl AccessUnit {
    pub fn is_key(&self) -> bool {
        self.nals.iter().any(|n| nal_type(n) == NAL_IDR)
    }

    fn has_slice(&self) -> bool {
        self.nals.iter().any(|n| matches!(nal_type(n), 1..=5))
    }

    /// Length-prefixed sample payload. Delimiters and parameter sets are left
    /// out; they travel in the sample entry.
    pub fn to_length_prefixed(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in &self.nals {
            if matches!(nal_type(nal), NAL_AUD | NAL_SPS | NAL_PPS) {
                continue;
            }
            out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out
    }
}

/// Groups NAL units into access units on access unit delimiters and tracks
/// the active parameter sets.
#[derive(Default)]
pub struct AccessUnitAssembler {
    current: AccessUnit,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, nal: Vec<u8>) -> Option<AccessUnit> {
        let kind = nal_type(&nal);
        let completed = if kind == NAL_AUD && self.current.has_slice() {
            Some(std::mem::take(&mut self.current))
        } else {
            None
        };

        match kind {
            NAL_SPS => self.sps = Some(nal.clone()),
            NAL_PPS => self.pps = Some(nal.clone()),
            _ => {}
        }
        self.current.nals.push(nal);
        completed
    }

    pub fn finish(&mut self) -> Option<AccessUnit> {
        let current = std::mem::take(&mut self.current);
        current.has_slice().then_some(current)
    }

    /// avcC payload once both parameter sets have been seen
    pub fn decoder_config(&self) -> Option<Vec<u8>> {
        match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) => Some(avc_decoder_config(sps, pps)),
            _ => None,
        }
    }
}

/// Build an AVCDecoderConfigurationRecord from one SPS and one PPS
pub fn avc_decoder_config(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let profile = sps.get(1).copied().unwrap_or(0);
    let mut payload = vec![
        1u8,                              // configurationVersion
        profile,                          // AVCProfileIndication
        sps.get(2).copied().unwrap_or(0), // profile_compatibility
        sps.get(3).copied().unwrap_or(0), // AVCLevelIndication
        0xFF,                             // lengthSizeMinusOne = 3
        0xE1,                             // one SPS
    ];
    payload.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    payload.extend_from_slice(sps);
    payload.push(1);
    payload.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    payload.extend_from_slice(pps);

    // High profiles carry chroma format and bit depth; yuv420p 8-bit here
    if matches!(profile, 100 | 110 | 122 | 144) {
        payload.extend_from_slice(&[0xFC | 1, 0xF8, 0xF8, 0]);
    }
    payload
}

/// Fields of an ADTS header that matter for the MP4 sample entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// Audio object type (2 = AAC-LC)
    pub object_type: u8,
    pub sampling_index: u8,
    pub channel_config: u8,
}

impl AdtsHeader {
    pub fn sample_rate(&self) -> Option<u32> {
        SAMPLING_FREQUENCIES.get(self.sampling_index as usize).copied()
    }

    pub fn audio_specific_config(&self) -> Vec<u8> {
        audio_specific_config(self.object_type, self.sampling_index, self.channel_config)
    }
}

/// A raw AAC frame with its ADTS header stripped
#[derive(Debug, Clone)]
pub struct AdtsFrame {
    pub header: AdtsHeader,
    pub payload: Vec<u8>,
}

/// Incremental ADTS frame parser
#[derive(Default)]
pub struct AdtsParser {
    buf: Vec<u8>,
}

impl AdtsParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<AdtsFrame> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut pos = 0;

        while self.buf.len() - pos >= 7 {
            let b = &self.buf[pos..];
            if b[0] != 0xFF || b[1] & 0xF0 != 0xF0 {
                pos += 1;
                continue;
            }

            let protection_absent = b[1] & 0x01 == 1;
            let header_len = if protection_absent { 7 } else { 9 };
            let frame_len =
                (((b[3] & 0x03) as usize) << 11) | ((b[4] as usize) << 3) | ((b[5] as usize) >> 5);
            if frame_len < header_len {
                pos += 1;
                continue;
            }
            if b.len() < frame_len {
                break;
            }

            let header = AdtsHeader {
                object_type: ((b[2] >> 6) & 0x03) + 1,
                sampling_index: (b[2] >> 2) & 0x0F,
                channel_config: ((b[2] & 0x01) << 2) | (b[3] >> 6),
            };
            frames.push(AdtsFrame {
                header,
                payload: b[header_len..frame_len].to_vec(),
            });
            pos += frame_len;
        }

        self.buf.drain(..pos);
        frames
    }
}

/// Two-byte AudioSpecificConfig
pub fn audio_specific_config(object_type: u8, sampling_index: u8, channel_config: u8) -> Vec<u8> {
    let value = ((object_type as u16) << 11)
        | ((sampling_index as u16 & 0x0F) << 7)
        | ((channel_config as u16 & 0x0F) << 3);
    value.to_be_bytes().to_vec()
}

pub fn sampling_frequency_index(sample_rate: u32) -> Option<u8> {
    SAMPLING_FREQUENCIES
        .iter()
        .position(|&f| f == sample_rate)
        .map(|i| i as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 6] = [0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9];
    const PPS: [u8; 4] = [0x68, 0xEB, 0xE3, 0xCB];

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_splitter_handles_split_start_codes() {
        let stream = annexb(&[&[0x09, 0xF0], &SPS, &PPS, &[0x65, 0x88, 0x84]]);
        let mut splitter = AnnexBSplitter::new();

        let mut nals = Vec::new();
        for piece in stream.chunks(3) {
            nals.extend(splitter.push(piece));
        }
        nals.extend(splitter.finish());

        assert_eq!(nals.len(), 4);
        assert_eq!(nals[1], SPS.to_vec());
        assert_eq!(nals[3], vec![0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_assembler_groups_on_delimiters() {
        let mut assembler = AccessUnitAssembler::new();
        let nals: Vec<Vec<u8>> = vec![
            vec![0x09, 0xF0],
            SPS.to_vec(),
            PPS.to_vec(),
            vec![0x65, 0x01],
            vec![0x09, 0xF0],
            vec![0x41, 0x02],
        ];

        let units: Vec<AccessUnit> = nals.into_iter().filter_map(|n| assembler.push(n)).collect();
        assert_eq!(units.len(), 1);
        assert!(units[0].is_key());
        assert_eq!(units[0].to_length_prefixed(), vec![0, 0, 0, 2, 0x65, 0x01]);

        let last = assembler.finish().unwrap();
        assert!(!last.is_key());
        assert!(assembler.decoder_config().is_some());
    }

    #[test]
    fn test_avcc_high_profile_extension() {
        let config = avc_decoder_config(&SPS, &PPS);
        assert_eq!(&config[..6], &[1, 0x64, 0x00, 0x28, 0xFF, 0xE1]);
        assert_eq!(config.len(), 6 + 2 + SPS.len() + 1 + 2 + PPS.len() + 4);
        assert_eq!(&config[config.len() - 4..], &[0xFD, 0xF8, 0xF8, 0]);
    }

    #[test]
    fn test_adts_frames_and_config() {
        // AAC-LC, 48 kHz, mono, 7-byte header + 3-byte payload
        let frame = [0xFF, 0xF1, 0x4C, 0x40, 0x01, 0x40, 0xFC, 0xAA, 0xBB, 0xCC];
        let mut stream = vec![0x00];
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(&frame[..5]);

        let mut parser = AdtsParser::new();
        let frames = parser.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(frames[0].header.sample_rate(), Some(48_000));
        assert_eq!(frames[0].header.audio_specific_config(), vec![0x11, 0x88]);

        let rest = parser.push(&frame[5..]);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_sampling_frequency_index() {
        assert_eq!(sampling_frequency_index(48_000), Some(3));
        assert_eq!(sampling_frequency_index(44_100), Some(4));
        assert_eq!(sampling_frequency_index(12_345), None);
    }
}

//! In-memory MP4 muxer
//!
//! Chunks are appended to an in-memory media buffer as they arrive. On
//! finalize the sample tables are built and the file is laid out as
//! `ftyp + moov + mdat` (fast start) or `ftyp + mdat + moov`.

use super::boxes;
use crate::capture::TrackKind;
use crate::codec::{AudioCodec, EncodedChunk, VideoCodec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MOVIE_TIMESCALE: u32 = 1000;
const VIDEO_TIMESCALE: u32 = 90_000;
const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

/// Muxer errors
#[derive(Error, Debug)]
pub enum MuxerError {
    #[error("Muxer already finalized")]
    AlreadyFinalized,

    #[error("Muxer not finalized")]
    NotFinalized,

    #[error("Output buffer already taken")]
    BufferTaken,

    #[error("Muxer has no audio track")]
    NoAudioTrack,

    #[error("No decoder configuration for {0} track")]
    MissingDecoderConfig(TrackKind),

    #[error("Out-of-order {track} timestamp: {candidate_us}us after {previous_us}us")]
    TimestampOrder {
        track: TrackKind,
        previous_us: u64,
        candidate_us: u64,
    },

    #[error("First {track} timestamp must be zero, got {timestamp_us}us")]
    NonZeroFirstTimestamp { track: TrackKind, timestamp_us: u64 },

    #[error("Cannot finalize without video samples")]
    NoVideoSamples,
}

/// How the first timestamp of each track is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirstTimestampBehavior {
    /// Rebase both tracks by the earliest first sample. A track starting later
    /// keeps its lead through an edit list.
    #[default]
    Offset,
    /// Reject a track whose first sample is not at zero
    Strict,
}

/// Where the movie metadata goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FastStart {
    /// Metadata ahead of the media data, laid out in memory at finalize
    #[default]
    InMemory,
    /// Metadata after the media data
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoTrackConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrackConfig {
    pub codec: AudioCodec,
    pub channels: u16,
    pub sample_rate: u32,
    /// Nominal bitrate advertised in the sample entry
    pub bitrate: u32,
}

/// Muxer construction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuxerConfig {
    pub video: VideoTrackConfig,
    /// Omitted entirely when there is no audio source
    pub audio: Option<AudioTrackConfig>,
    #[serde(default)]
    pub fast_start: FastStart,
    #[serde(default)]
    pub first_timestamp_behavior: FirstTimestampBehavior,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    offset: u64,
    size: u32,
    timestamp_us: u64,
    duration_us: u64,
    is_key: bool,
}

#[derive(Default)]
struct TrackState {
    samples: Vec<Sample>,
    decoder_config: Option<Vec<u8>>,
    first_timestamp_us: Option<u64>,
}

impl TrackState {
    fn last_timestamp_us(&self) -> Option<u64> {
        self.samples.last().map(|s| s.timestamp_us)
    }

    /// Time from the first sample's start to the last sample's end
    fn media_duration_us(&self) -> u64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.timestamp_us + last.duration_us - first.timestamp_us,
            _ => 0,
        }
    }
}

struct Inner {
    video: TrackState,
    audio: Option<TrackState>,
    mdat: Vec<u8>,
    finalized: bool,
    output: Option<Vec<u8>>,
}

/// Two-track MP4 writer.
///
/// `add_*_chunk` may be called from different threads in any interleaving;
/// per-track order is preserved.
pub struct Mp4Muxer {
    config: MuxerConfig,
    inner: Mutex<Inner>,
}

impl Mp4Muxer {
    pub fn new(config: MuxerConfig) -> Self {
        let audio = config.audio.as_ref().map(|_| TrackState::default());
        tracing::debug!(
            "Muxer created: {}x{} video, audio track: {}",
            config.video.width,
            config.video.height,
            audio.is_some()
        );
        Self {
            config,
            inner: Mutex::new(Inner {
                video: TrackState::default(),
                audio,
                mdat: Vec::new(),
                finalized: false,
                output: None,
            }),
        }
    }

    pub fn config(&self) -> &MuxerConfig {
        &self.config
    }

    pub fn has_audio_track(&self) -> bool {
        self.config.audio.is_some()
    }

    pub fn add_video_chunk(&self, chunk: EncodedChunk) -> Result<(), MuxerError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if inner.finalized {
            return Err(MuxerError::AlreadyFinalized);
        }
        Self::append(
            &mut inner.video,
            &mut inner.mdat,
            chunk,
            TrackKind::Video,
            self.config.first_timestamp_behavior,
        )
    }

    pub fn add_audio_chunk(&self, chunk: EncodedChunk) -> Result<(), MuxerError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if inner.finalized {
            return Err(MuxerError::AlreadyFinalized);
        }
        let track = inner.audio.as_mut().ok_or(MuxerError::NoAudioTrack)?;
        Self::append(
            track,
            &mut inner.mdat,
            chunk,
            TrackKind::Audio,
            self.config.first_timestamp_behavior,
        )
    }

    fn append(
        track: &mut TrackState,
        mdat: &mut Vec<u8>,
        chunk: EncodedChunk,
        kind: TrackKind,
        behavior: FirstTimestampBehavior,
    ) -> Result<(), MuxerError> {
        if track.decoder_config.is_none() {
            match chunk.decoder_config {
                Some(config) => track.decoder_config = Some(config),
                None => return Err(MuxerError::MissingDecoderConfig(kind)),
            }
        }

        if track.first_timestamp_us.is_none() {
            if behavior == FirstTimestampBehavior::Strict && chunk.timestamp_us != 0 {
                return Err(MuxerError::NonZeroFirstTimestamp {
                    track: kind,
                    timestamp_us: chunk.timestamp_us,
                });
            }
            track.first_timestamp_us = Some(chunk.timestamp_us);
        }

        // Samples keep their submitted times; the common rebase happens at finalize
        if let Some(previous_us) = track.last_timestamp_us() {
            if chunk.timestamp_us < previous_us {
                return Err(MuxerError::TimestampOrder {
                    track: kind,
                    previous_us,
                    candidate_us: chunk.timestamp_us,
                });
            }
        }

        track.samples.push(Sample {
            offset: mdat.len() as u64,
            size: chunk.data.len() as u32,
            timestamp_us: chunk.timestamp_us,
            duration_us: chunk.duration_us,
            is_key: chunk.is_key,
        });
        mdat.extend_from_slice(&chunk.data);
        Ok(())
    }

    /// Close all boxes and lay out the file. Callable once.
    ///
    /// Returns the size of the finished file.
    pub fn finalize(&self) -> Result<usize, MuxerError> {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return Err(MuxerError::AlreadyFinalized);
        }
        inner.finalized = true;

        if inner.video.samples.is_empty() {
            return Err(MuxerError::NoVideoSamples);
        }

        let mdat = std::mem::take(&mut inner.mdat);
        let audio = inner
            .audio
            .as_ref()
            .filter(|track| !track.samples.is_empty());
        if inner.audio.is_some() && audio.is_none() {
            tracing::warn!("Audio track received no samples, writing video only");
        }

        let base_us = [Some(&inner.video), audio]
            .into_iter()
            .flatten()
            .filter_map(|track| track.first_timestamp_us)
            .min()
            .unwrap_or(0);
        let layout = Layout {
            config: &self.config,
            video: &inner.video,
            audio,
            base_us,
        };
        let output = layout.write(mdat)?;
        let size = output.len();

        tracing::info!(
            "Muxer finalized: {} video samples, {} audio samples, {} bytes",
            inner.video.samples.len(),
            audio.map(|a| a.samples.len()).unwrap_or(0),
            size
        );

        inner.output = Some(output);
        Ok(size)
    }

    /// Take the finished file
    pub fn take_buffer(&self) -> Result<Vec<u8>, MuxerError> {
        let mut inner = self.inner.lock();
        if !inner.finalized {
            return Err(MuxerError::NotFinalized);
        }
        inner.output.take().ok_or(MuxerError::BufferTaken)
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.lock().finalized
    }
}

struct Layout<'a> {
    config: &'a MuxerConfig,
    video: &'a TrackState,
    audio: Option<&'a TrackState>,
    /// Earliest first timestamp across tracks, presented at zero
    base_us: u64,
}

impl Layout<'_> {
    fn write(&self, mdat: Vec<u8>) -> Result<Vec<u8>, MuxerError> {
        let ftyp = boxes::ftyp();
        let mdat_header = boxes::mdat_header(mdat.len() as u64);

        let media_end = ftyp.len() as u64 + mdat_header.len() as u64 + mdat.len() as u64;
        // Upper bound on the metadata size with 4-byte offsets, to pick stco or co64
        let probe = self.moov(0, false)?;
        let wide = media_end + probe.len() as u64 > u32::MAX as u64;

        let mut out;
        match self.config.fast_start {
            FastStart::InMemory => {
                let moov_len = self.moov(0, wide)?.len() as u64;
                let base = ftyp.len() as u64 + moov_len + mdat_header.len() as u64;
                let moov = self.moov(base, wide)?;
                out = Vec::with_capacity(media_end as usize + moov.len());
                out.extend_from_slice(&ftyp);
                out.extend_from_slice(&moov);
                out.extend_from_slice(&mdat_header);
                out.extend_from_slice(&mdat);
            }
            FastStart::Off => {
                let base = ftyp.len() as u64 + mdat_header.len() as u64;
                let moov = self.moov(base, wide)?;
                out = Vec::with_capacity(media_end as usize + moov.len());
                out.extend_from_slice(&ftyp);
                out.extend_from_slice(&mdat_header);
                out.extend_from_slice(&mdat);
                out.extend_from_slice(&moov);
            }
        }
        Ok(out)
    }

    /// Presentation delay of a track relative to the earliest track
    fn lead_us(&self, track: &TrackState) -> u64 {
        track
            .first_timestamp_us
            .map(|first| first.saturating_sub(self.base_us))
            .unwrap_or(0)
    }

    /// Lead plus media, in movie ticks
    fn presented_ms(&self, track: &TrackState) -> u32 {
        ((self.lead_us(track) + track.media_duration_us()) / 1000) as u32
    }

    fn edit_list(&self, track: &TrackState) -> Option<Vec<u8>> {
        let lead_ms = self.lead_us(track) / 1000;
        (lead_ms > 0).then(|| boxes::edts(lead_ms as u32, (track.media_duration_us() / 1000) as u32))
    }

    fn moov(&self, base: u64, wide: bool) -> Result<Vec<u8>, MuxerError> {
        let video_duration_ms = self.presented_ms(self.video);
        let audio_duration_ms = self.audio.map(|a| self.presented_ms(a)).unwrap_or(0);
        let movie_duration = video_duration_ms.max(audio_duration_ms);

        let mut children = vec![boxes::mvhd(
            MOVIE_TIMESCALE,
            movie_duration,
            if self.audio.is_some() { AUDIO_TRACK_ID + 1 } else { VIDEO_TRACK_ID + 1 },
        )];
        children.push(self.video_trak(base, wide)?);
        if let Some(audio) = self.audio {
            children.push(self.audio_trak(audio, base, wide)?);
        }
        Ok(boxes::container(b"moov", &children))
    }

    fn video_trak(&self, base: u64, wide: bool) -> Result<Vec<u8>, MuxerError> {
        let video = &self.config.video;
        let avcc = self
            .video
            .decoder_config
            .as_deref()
            .ok_or(MuxerError::MissingDecoderConfig(TrackKind::Video))?;

        let tables = SampleTables::new(self.video, VIDEO_TIMESCALE);
        let sync: Vec<u32> = self
            .video
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_key)
            .map(|(i, _)| i as u32 + 1)
            .collect();

        let mut stbl = vec![
            boxes::stsd_avc1(video.width, video.height, avcc),
            boxes::stts(&tables.deltas),
        ];
        if sync.len() < self.video.samples.len() {
            stbl.push(boxes::stss(&sync));
        }
        stbl.extend(tables.boxes(base, wide));

        Ok(trak(
            boxes::tkhd(
                VIDEO_TRACK_ID,
                self.presented_ms(self.video),
                video.width,
                video.height,
                false,
            ),
            self.edit_list(self.video),
            VIDEO_TIMESCALE,
            tables.duration,
            boxes::hdlr(b"vide", "VideoHandler"),
            boxes::vmhd(),
            stbl,
        ))
    }

    fn audio_trak(&self, audio: &TrackState, base: u64, wide: bool) -> Result<Vec<u8>, MuxerError> {
        let config = self
            .config
            .audio
            .as_ref()
            .ok_or(MuxerError::NoAudioTrack)?;
        let asc = audio
            .decoder_config
            .as_deref()
            .ok_or(MuxerError::MissingDecoderConfig(TrackKind::Audio))?;

        let tables = SampleTables::new(audio, config.sample_rate);
        let mut stbl = vec![
            boxes::stsd_mp4a(config.channels, config.sample_rate, asc, config.bitrate),
            boxes::stts(&tables.deltas),
        ];
        stbl.extend(tables.boxes(base, wide));

        Ok(trak(
            boxes::tkhd(AUDIO_TRACK_ID, self.presented_ms(audio), 0, 0, true),
            self.edit_list(audio),
            config.sample_rate,
            tables.duration,
            boxes::hdlr(b"soun", "SoundHandler"),
            boxes::smhd(),
            stbl,
        ))
    }
}

fn trak(
    tkhd: Vec<u8>,
    edts: Option<Vec<u8>>,
    timescale: u32,
    duration: u32,
    hdlr: Vec<u8>,
    media_header: Vec<u8>,
    stbl: Vec<Vec<u8>>,
) -> Vec<u8> {
    let minf = boxes::container(
        b"minf",
        &[media_header, boxes::dinf(), boxes::container(b"stbl", &stbl)],
    );
    let mdia = boxes::container(b"mdia", &[boxes::mdhd(timescale, duration), hdlr, minf]);
    let mut children = vec![tkhd];
    children.extend(edts);
    children.push(mdia);
    boxes::container(b"trak", &children)
}

fn to_timescale(us: u64, timescale: u32) -> u64 {
    (us as u128 * timescale as u128 / 1_000_000) as u64
}

struct SampleTables<'a> {
    track: &'a TrackState,
    deltas: Vec<u32>,
    duration: u32,
}

impl<'a> SampleTables<'a> {
    fn new(track: &'a TrackState, timescale: u32) -> Self {
        let starts: Vec<u64> = track
            .samples
            .iter()
            .map(|s| to_timescale(s.timestamp_us, timescale))
            .collect();

        let mut deltas: Vec<u32> = starts.windows(2).map(|w| (w[1] - w[0]) as u32).collect();
        if let Some(last) = track.samples.last() {
            deltas.push(to_timescale(last.duration_us, timescale) as u32);
        }
        let duration = deltas.iter().map(|&d| d as u64).sum::<u64>() as u32;

        Self {
            track,
            deltas,
            duration,
        }
    }

    fn boxes(&self, base: u64, wide: bool) -> Vec<Vec<u8>> {
        let sizes: Vec<u32> = self.track.samples.iter().map(|s| s.size).collect();
        let offsets: Vec<u64> = self.track.samples.iter().map(|s| base + s.offset).collect();
        vec![
            boxes::stsc_single(),
            boxes::stsz(&sizes),
            boxes::chunk_offsets(&offsets, wide),
        ]
    }
}

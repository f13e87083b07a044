//! Float to 16-bit fixed-point sample conversion

/// Convert one float sample to signed 16-bit.
///
/// Clamps to `[-1, 1]`, then scales negatives by `0x8000` and non-negatives by
/// `0x7FFF`, so `-1.0 → -32768` and `1.0 → 32767` without wrapping.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 0x8000 as f32) as i16
    } else {
        (s * 0x7FFF as f32) as i16
    }
}

/// Convert a block of float samples
pub fn convert_block(input: &[f32]) -> Vec<i16> {
    input.iter().map(|&s| f32_to_i16(s)).collect()
}

/// Collects converted samples into fixed-size blocks.
pub struct Rechunker {
    block_len: usize,
    channels: usize,
    pending: Vec<i16>,
}

impl Rechunker {
    /// `block_frames` samples per channel in each emitted block
    pub fn new(block_frames: usize, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        let block_len = block_frames.max(1) * channels;
        Self {
            block_len,
            channels,
            pending: Vec::with_capacity(block_len),
        }
    }

    /// Convert `input` and return every block that is now complete
    pub fn push(&mut self, input: &[f32]) -> Vec<Vec<i16>> {
        let mut blocks = Vec::new();
        for &sample in input {
            self.pending.push(f32_to_i16(sample));
            if self.pending.len() == self.block_len {
                let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_len));
                blocks.push(block);
            }
        }
        blocks
    }

    /// Take the trailing partial block, trimmed to whole frames
    pub fn finish(&mut self) -> Option<Vec<i16>> {
        let whole = self.pending.len() - self.pending.len() % self.channels;
        self.pending.truncate(whole);
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Samples waiting for the next block
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_scale_endpoints() {
        assert_eq!(f32_to_i16(1.0), 0x7FFF);
        assert_eq!(f32_to_i16(-1.0), -0x8000);
        assert_eq!(f32_to_i16(0.0), 0);
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        assert_eq!(f32_to_i16(1.5), i16::MAX);
        assert_eq!(f32_to_i16(-3.0), i16::MIN);
    }

    #[test]
    fn test_asymmetric_scaling() {
        assert_eq!(f32_to_i16(0.5), 16383);
        assert_eq!(f32_to_i16(-0.5), -16384);
    }

    #[test]
    fn test_rechunker_emits_fixed_blocks() {
        let mut rechunker = Rechunker::new(4, 1);
        assert!(rechunker.push(&[0.0; 3]).is_empty());

        let blocks = rechunker.push(&[1.0; 6]);
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.len() == 4));
        assert_eq!(blocks[1], vec![0x7FFF; 4]);
        assert_eq!(rechunker.pending_len(), 1);
    }

    #[test]
    fn test_finish_trims_to_whole_frames() {
        let mut rechunker = Rechunker::new(4, 2);
        rechunker.push(&[0.0; 5]);
        let tail = rechunker.finish().unwrap();
        assert_eq!(tail.len(), 4);
        assert!(rechunker.finish().is_none());
    }
}

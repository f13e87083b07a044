//! Audio sample conversion
//!
//! Float samples from the microphone feed become 16-bit fixed-point blocks for
//! the audio encoder. Conversion runs either on a dedicated thread or inline
//! on the consumer.

pub mod convert;
pub mod processor;

pub use convert::{convert_block, f32_to_i16, Rechunker};
pub use processor::{
    AudioPipeline, AudioPipelineConfig, AudioProcessingMode, BlockPoll, BlockReceiver, SampleBlock,
};

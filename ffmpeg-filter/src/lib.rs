/// Registers FFmpeg components. Call once at startup before opening any media.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod completion;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod input;
pub mod lane;
pub mod metadata;
pub mod output;
pub mod pool;
pub mod scaler;
pub mod sink;
pub mod stream;
#[cfg(test)]
mod test_fixture;
pub mod transcode;
pub mod transform;

pub use error::{TranscodeError, TranscodeResult};
pub use frame::FrameImage;
pub use metadata::{MediaInfo, probe};
pub use transcode::{TranscodeJob, TranscodeOptions, filter_video, spawn_transcode, transcode};
pub use transform::ProcessingFunction;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ffmpeg_filter::TranscodeOptions;

use crate::filters::FilterKind;

#[derive(Parser, Debug)]
#[command(name = "video-filter", version)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print container and stream metadata.
    Probe {
        /// Media file to inspect.
        path: PathBuf,
    },
    /// Re-encode a file, running a filter on every video frame.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source media file.
    pub source: PathBuf,

    #[arg(long, value_enum, default_value_t = FilterKind::Grayscale)]
    pub filter: FilterKind,

    /// Brightness offset for `--filter brighten`.
    #[arg(long, default_value_t = 40, allow_hyphen_values = true)]
    pub brightness: i32,

    /// Gaussian sigma for `--filter blur`.
    #[arg(long, default_value_t = 2.0)]
    pub sigma: f32,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug)]
pub struct OutputArgs {
    /// Directory the filtered file is written to.
    #[arg(long, env = "VIDEO_FILTER_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output container, "mp4" or "mov".
    #[arg(long, env = "VIDEO_FILTER_CONTAINER", default_value = "mp4")]
    pub container: String,

    /// Preferred video encoder; any H.264 encoder is used if it is missing.
    #[arg(long, env = "VIDEO_FILTER_CODEC", default_value = "libx264")]
    pub codec: String,

    #[arg(long, env = "VIDEO_FILTER_PRESET")]
    pub preset: Option<String>,

    #[arg(long, env = "VIDEO_FILTER_AUDIO_BIT_RATE", default_value_t = 128_000)]
    pub audio_bit_rate: usize,
}

impl OutputArgs {
    pub fn options(&self) -> anyhow::Result<TranscodeOptions> {
        if !matches!(self.container.as_str(), "mp4" | "mov") {
            anyhow::bail!("unsupported container {:?}, expected mp4 or mov", self.container);
        }
        let defaults = TranscodeOptions::default();
        Ok(TranscodeOptions {
            output_dir: self.output_dir.clone().unwrap_or(defaults.output_dir),
            container: self.container.clone(),
            video_codec: self.codec.clone(),
            video_preset: self.preset.clone().or(defaults.video_preset),
            audio_bit_rate: self.audio_bit_rate,
            ..defaults
        })
    }
}

//! Sample clips written at test time with the crate's own muxer.

use std::path::{Path, PathBuf};

use ffmpeg_next::{
    ChannelLayout, Rational,
    format::{Sample, sample},
    frame,
};

use crate::{
    encoder::{AudioSettings, Encoder, VideoSettings},
    frame::{FrameImage, RawAudioFrame, TransformedFrame},
    geometry::Transform,
    lane::LaneSink,
    output::AvOutput,
    sink::{AudioWriterInput, VideoWriterInput},
};

pub const FPS: i32 = 10;
pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 96;
pub const SAMPLE_RATE: u32 = 44_100;
const AUDIO_CHUNK: i64 = 1024;

pub struct Fixture {
    pub frames: i64,
    pub audio: bool,
    pub rotation: f64,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            frames: 10,
            audio: true,
            rotation: 0.0,
        }
    }
}

fn pattern(index: i64) -> FrameImage {
    FrameImage::from_fn(WIDTH, HEIGHT, |x, y| {
        image::Rgba([
            (x * 255 / WIDTH) as u8,
            (y * 255 / HEIGHT) as u8,
            (index * 25 % 256) as u8,
            255,
        ])
    })
}

fn sine(start: i64, samples: i64) -> RawAudioFrame {
    let mut audio = frame::Audio::new(
        Sample::I16(sample::Type::Packed),
        samples as usize,
        ChannelLayout::STEREO,
    );
    audio.set_rate(SAMPLE_RATE);
    let data = audio.data_mut(0);
    for i in 0..samples as usize {
        let t = (start as f64 + i as f64) / SAMPLE_RATE as f64;
        let value = ((2.0 * std::f64::consts::PI * 440.0 * t).sin() * 8000.0) as i16;
        let bytes = value.to_ne_bytes();
        data[i * 4..i * 4 + 2].copy_from_slice(&bytes);
        data[i * 4 + 2..i * 4 + 4].copy_from_slice(&bytes);
    }
    audio.set_pts(Some(start));
    RawAudioFrame::new(audio, Rational::new(1, SAMPLE_RATE as i32))
}

/// Writes a source clip with the crate's own writer inputs.
fn write_fixture(path: &Path, fixture: Fixture, runtime: &tokio::runtime::Handle) -> anyhow::Result<()> {
    let mut output = AvOutput::create(path)?;
    let global_header = output.global_header();
    let time_base = Rational::new(1, FPS);

    let video_encoder = Encoder::video(&VideoSettings {
        width: WIDTH,
        height: HEIGHT,
        time_base,
        frame_rate: Some(Rational::new(FPS, 1)),
        bit_rate: 400_000,
        codec: "libx264".to_string(),
        preset: Some("ultrafast".to_string()),
        global_header,
    })?;
    let port = output.add_input(&video_encoder, Some(Transform::rotation(fixture.rotation)), 64)?;
    let mut video = VideoWriterInput::new(video_encoder, port, WIDTH, HEIGHT, 2);

    let mut audio = if fixture.audio {
        let audio_encoder = Encoder::audio(&AudioSettings {
            rate: SAMPLE_RATE,
            channels: 2,
            bit_rate: 128_000,
            global_header,
        })?;
        let port = output.add_input(&audio_encoder, None, 64)?;
        Some(AudioWriterInput::new(audio_encoder, port, SAMPLE_RATE, 2))
    } else {
        None
    };

    let mux = output.start_writing(runtime)?;
    for index in 0..fixture.frames {
        video.append(TransformedFrame {
            image: pattern(index),
            pts: Some(index),
            time_base,
        })?;
    }
    video.mark_finished()?;

    if let Some(audio) = audio.as_mut() {
        let total = SAMPLE_RATE as i64 * fixture.frames / FPS as i64;
        let mut start = 0;
        while start < total {
            let samples = AUDIO_CHUNK.min(total - start);
            audio.append(sine(start, samples))?;
            start += samples;
        }
        audio.mark_finished()?;
    }
    mux.finish()
}

pub async fn fixture(dir: &Path, name: &str, fixture: Fixture) -> anyhow::Result<PathBuf> {
    crate::init()?;
    let path = dir.join(format!("{}.mp4", name));
    let target = path.clone();
    let runtime = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || write_fixture(&target, fixture, &runtime)).await??;
    Ok(path)
}

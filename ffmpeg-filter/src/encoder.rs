use ffmpeg_next::{
    ChannelLayout, Codec, Dictionary, Packet, Rational,
    codec::{self, Parameters},
    format::{Pixel, Sample, sample},
    frame,
};

/// Pixel format fed to the video encoder.
pub const VIDEO_ENCODE_FORMAT: Pixel = Pixel::YUV420P;
/// Sample format fed to the audio encoder.
pub const AUDIO_ENCODE_FORMAT: Sample = Sample::F32(sample::Type::Planar);
/// Fallback AAC frame size when the encoder does not report one.
const AAC_FRAME_SIZE: usize = 1024;

pub enum EncoderType {
    Video(ffmpeg_next::codec::encoder::Video),
    Audio(ffmpeg_next::codec::encoder::Audio),
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub time_base: Rational,
    pub frame_rate: Option<Rational>,
    pub bit_rate: usize,
    pub codec: String,
    pub preset: Option<String>,
    pub global_header: bool,
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub rate: u32,
    pub channels: u32,
    pub bit_rate: usize,
    pub global_header: bool,
}

pub struct Encoder {
    inner: EncoderType,
    codec: Codec,
    time_base: Rational,
    frame_size: usize,
}

unsafe impl Send for Encoder {}

impl Encoder {
    /// H.264 encoder; `settings.codec` is tried by name first, then whatever
    /// H.264 encoder FFmpeg has registered.
    pub fn video(settings: &VideoSettings) -> anyhow::Result<Self> {
        let codec = match ffmpeg_next::encoder::find_by_name(&settings.codec) {
            Some(codec) => codec,
            None => {
                log::warn!(
                    "encoder {} not found, falling back to default h264 encoder",
                    settings.codec
                );
                ffmpeg_next::encoder::find(codec::Id::H264)
                    .ok_or_else(|| anyhow::anyhow!("no h264 encoder available"))?
            }
        };

        let mut encoder = codec::Context::new_with_codec(codec).encoder().video()?;
        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(VIDEO_ENCODE_FORMAT);
        encoder.set_time_base(settings.time_base);
        encoder.set_frame_rate(settings.frame_rate);
        encoder.set_bit_rate(settings.bit_rate);
        if settings.global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        if let Some(preset) = &settings.preset {
            opts.set("preset", preset);
        }
        let encoder = encoder.open_with(opts)?;
        log::info!(
            "video encoder opened: {} {}x{} at {} bps",
            codec.name(),
            settings.width,
            settings.height,
            settings.bit_rate
        );

        let time_base: Rational = unsafe { (*encoder.as_ptr()).time_base.into() };
        Ok(Self {
            inner: EncoderType::Video(encoder),
            codec,
            time_base,
            frame_size: 0,
        })
    }

    /// AAC encoder taking planar float samples at the source rate.
    pub fn audio(settings: &AudioSettings) -> anyhow::Result<Self> {
        let codec = ffmpeg_next::encoder::find(codec::Id::AAC)
            .ok_or_else(|| anyhow::anyhow!("no aac encoder available"))?;

        let mut encoder = codec::Context::new_with_codec(codec).encoder().audio()?;
        encoder.set_rate(settings.rate as i32);
        encoder.set_channel_layout(ChannelLayout::default(settings.channels as i32));
        encoder.set_format(AUDIO_ENCODE_FORMAT);
        encoder.set_bit_rate(settings.bit_rate);
        encoder.set_time_base(Rational::new(1, settings.rate as i32));
        if settings.global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let encoder = encoder.open_with(Dictionary::new())?;
        let frame_size = match encoder.frame_size() as usize {
            0 => AAC_FRAME_SIZE,
            n => n,
        };
        log::info!(
            "audio encoder opened: {} {} Hz, {} channels, {} bps, frame size {}",
            codec.name(),
            settings.rate,
            settings.channels,
            settings.bit_rate,
            frame_size
        );

        Ok(Self {
            inner: EncoderType::Audio(encoder),
            codec,
            time_base: Rational::new(1, settings.rate as i32),
            frame_size,
        })
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Time base of the packets coming out of [`Encoder::receive_packet`].
    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Samples per channel the audio encoder wants per frame; 0 for video.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Codec parameters for the output stream, extradata included.
    pub fn parameters(&self) -> Parameters {
        match &self.inner {
            EncoderType::Video(encoder) => Parameters::from(encoder),
            EncoderType::Audio(encoder) => Parameters::from(encoder),
        }
    }

    pub fn send_video(&mut self, frame: &frame::Video) -> anyhow::Result<()> {
        match &mut self.inner {
            EncoderType::Video(encoder) => encoder.send_frame(frame)?,
            EncoderType::Audio(_) => anyhow::bail!("video frame sent to audio encoder"),
        }
        Ok(())
    }

    pub fn send_audio(&mut self, frame: &frame::Audio) -> anyhow::Result<()> {
        match &mut self.inner {
            EncoderType::Audio(encoder) => encoder.send_frame(frame)?,
            EncoderType::Video(_) => anyhow::bail!("audio frame sent to video encoder"),
        }
        Ok(())
    }

    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        match &mut self.inner {
            EncoderType::Video(encoder) => encoder.send_eof()?,
            EncoderType::Audio(encoder) => encoder.send_eof()?,
        }
        Ok(())
    }

    /// Next encoded packet, `None` when the encoder needs more input or is drained.
    pub fn receive_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        let mut packet = Packet::empty();
        let encode_result = match &mut self.inner {
            EncoderType::Video(encoder) => encoder.receive_packet(&mut packet),
            EncoderType::Audio(encoder) => encoder.receive_packet(&mut packet),
        };

        match encode_result {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

use ffmpeg_next::{Packet, frame};

use crate::stream::AvTrack;

/// Result of asking a decoder for its next frame.
pub enum Receive<T> {
    Frame(T),
    /// The decoder needs another packet first.
    Again,
    /// Fully drained after end of stream.
    Eof,
}

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

fn classify<T>(result: Result<(), ffmpeg_next::Error>, frame: T) -> anyhow::Result<Receive<T>> {
    match result {
        Ok(()) => Ok(Receive::Frame(frame)),
        Err(ffmpeg_next::Error::Eof) => Ok(Receive::Eof),
        Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
            Ok(Receive::Again)
        }
        Err(err) => Err(err.into()),
    }
}

/// Decoder for one source track. Packets are expected in the track's own time
/// base, so decoded timestamps come out in that time base too.
pub struct Decoder {
    stream_index: usize,
    inner: DecoderType,
    flushing: bool,
}

unsafe impl Send for Decoder {}

impl Decoder {
    pub fn new(track: &AvTrack) -> anyhow::Result<Self> {
        let mut decoder_ctx = ffmpeg_next::codec::Context::new();
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = track.time_base().into();
        }
        decoder_ctx.set_parameters(track.parameters().clone())?;

        let inner = if track.is_video() {
            let video_decoder = decoder_ctx.decoder().video()?;
            if video_decoder.format() == ffmpeg_next::format::Pixel::None
                || video_decoder.width() == 0
                || video_decoder.height() == 0
            {
                anyhow::bail!("missing codec parameters for stream {}", track.index());
            }
            DecoderType::Video(video_decoder)
        } else if track.is_audio() {
            DecoderType::Audio(decoder_ctx.decoder().audio()?)
        } else {
            anyhow::bail!("unsupported stream type {:?}", track.medium());
        };

        Ok(Self {
            stream_index: track.index(),
            inner,
            flushing: false,
        })
    }

    pub fn send_packet(&mut self, packet: &Packet) -> anyhow::Result<()> {
        match &mut self.inner {
            DecoderType::Video(decoder) => decoder.send_packet(packet)?,
            DecoderType::Audio(decoder) => decoder.send_packet(packet)?,
        }
        Ok(())
    }

    /// Enters draining mode. Calling it again is a no-op.
    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        if self.flushing {
            return Ok(());
        }
        self.flushing = true;
        match &mut self.inner {
            DecoderType::Video(decoder) => decoder.send_eof()?,
            DecoderType::Audio(decoder) => decoder.send_eof()?,
        }
        Ok(())
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub fn receive_video(&mut self) -> anyhow::Result<Receive<frame::Video>> {
        let DecoderType::Video(decoder) = &mut self.inner else {
            anyhow::bail!("stream {} is not a video stream", self.stream_index);
        };
        let mut frame = frame::Video::empty();
        let result = decoder.receive_frame(&mut frame);
        classify(result, frame)
    }

    pub fn receive_audio(&mut self) -> anyhow::Result<Receive<frame::Audio>> {
        let DecoderType::Audio(decoder) = &mut self.inner else {
            anyhow::bail!("stream {} is not an audio stream", self.stream_index);
        };
        let mut frame = frame::Audio::empty();
        let result = decoder.receive_frame(&mut frame);
        classify(result, frame)
    }
}

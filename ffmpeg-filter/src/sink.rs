//! Writer inputs: encode what a lane appends and hand the packets to the muxer.

use std::sync::Arc;

use ffmpeg_next::{ChannelLayout, Rational, Rescale, format::Pixel, frame};

use crate::{
    encoder::{AUDIO_ENCODE_FORMAT, Encoder, VIDEO_ENCODE_FORMAT},
    error::{TranscodeError, TranscodeResult},
    frame::{FrameImage, RawAudioFrame, TransformedFrame, image_into_video},
    lane::{LaneKind, LaneSink, ReadySignal},
    output::WriterPort,
    pool::FramePool,
    scaler::{RESAMPLE_FLUSH_CHUNK, RESAMPLE_SLACK, Resampler, Scaler, channel_layout},
};

fn drain_packets(encoder: &mut Encoder, port: &WriterPort) -> anyhow::Result<()> {
    while let Some(packet) = encoder.receive_packet()? {
        port.send(packet)?;
    }
    Ok(())
}

/// Video input of the muxer. Each appended image is scaled into a pooled
/// YUV420P raster at the encode size and encoded with its original timestamp.
pub struct VideoWriterInput {
    encoder: Encoder,
    port: WriterPort,
    pool: FramePool,
    width: u32,
    height: u32,
    staging: Option<frame::Video>,
    scaler: Option<Scaler>,
    frames: u64,
}

impl VideoWriterInput {
    pub fn new(encoder: Encoder, port: WriterPort, width: u32, height: u32, pool_size: usize) -> Self {
        Self {
            encoder,
            port,
            pool: FramePool::new(VIDEO_ENCODE_FORMAT, width, height, pool_size),
            width,
            height,
            staging: None,
            scaler: None,
            frames: 0,
        }
    }

    fn encode(&mut self, image: &FrameImage, pts: Option<i64>, time_base: Rational) -> anyhow::Result<()> {
        let staging = match self.staging.take() {
            Some(frame) if (frame.width(), frame.height()) == image.dimensions() => frame,
            _ => frame::Video::new(Pixel::RGBA, image.width(), image.height()),
        };
        let staging = self.staging.insert(staging);
        image_into_video(image, staging)?;

        if !self.scaler.as_ref().is_some_and(|s| s.accepts(staging)) {
            self.scaler = Some(Scaler::get(
                Pixel::RGBA,
                image.width(),
                image.height(),
                VIDEO_ENCODE_FORMAT,
                self.width,
                self.height,
            )?);
        }

        let mut target = self.pool.acquire()?;
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(staging, &mut target)?;
        }
        target.set_pts(pts.map(|pts| pts.rescale(time_base, self.encoder.time_base())));
        self.encoder.send_video(&target)?;
        drop(target);

        self.frames += 1;
        drain_packets(&mut self.encoder, &self.port)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.encoder.send_eof()?;
        drain_packets(&mut self.encoder, &self.port)?;
        log::debug!("video input finished after {} frames", self.frames);
        Ok(())
    }
}

impl LaneSink for VideoWriterInput {
    type Unit = TransformedFrame;

    fn is_ready(&self) -> bool {
        self.port.is_ready()
    }

    fn append(&mut self, unit: TransformedFrame) -> TranscodeResult<()> {
        self.encode(&unit.image, unit.pts, unit.time_base)
            .map_err(|e| TranscodeError::lane(LaneKind::Video, e))
    }

    fn mark_finished(&mut self) -> TranscodeResult<()> {
        self.finish()
            .map_err(|e| TranscodeError::lane(LaneKind::Video, e))
    }

    fn ready_signal(&self) -> Arc<ReadySignal> {
        self.port.ready_signal()
    }
}

/// Per-channel sample queue cutting arbitrary-sized input into encoder-sized frames.
struct SampleFifo {
    channels: Vec<Vec<f32>>,
}

impl SampleFifo {
    fn new(channels: usize) -> Self {
        Self {
            channels: vec![Vec::new(); channels],
        }
    }

    fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    fn push(&mut self, frame: &frame::Audio) {
        let samples = frame.samples();
        for (index, queue) in self.channels.iter_mut().enumerate() {
            queue.extend_from_slice(&frame.plane::<f32>(index)[..samples]);
        }
    }

    /// Moves up to `frame.samples()` samples into `frame`, zero-padding the rest.
    fn pop_into(&mut self, frame: &mut frame::Audio) {
        let size = frame.samples();
        let available = self.len().min(size);
        for (index, queue) in self.channels.iter_mut().enumerate() {
            let plane = &mut frame.plane_mut::<f32>(index)[..size];
            plane[..available].copy_from_slice(&queue[..available]);
            plane[available..].fill(0.0);
            queue.drain(..available);
        }
    }
}

/// Audio input of the muxer. Converts the reader's PCM to the encoder's
/// planar float format and feeds the encoder fixed-size frames.
pub struct AudioWriterInput {
    encoder: Encoder,
    port: WriterPort,
    rate: u32,
    layout: ChannelLayout,
    resampler: Option<Resampler>,
    fifo: SampleFifo,
    next_pts: Option<i64>,
}

impl AudioWriterInput {
    pub fn new(encoder: Encoder, port: WriterPort, rate: u32, channels: u32) -> Self {
        Self {
            encoder,
            port,
            rate,
            layout: ChannelLayout::default(channels as i32),
            resampler: None,
            fifo: SampleFifo::new(channels.max(1) as usize),
            next_pts: None,
        }
    }

    fn time_base(&self) -> Rational {
        Rational::new(1, self.rate as i32)
    }

    fn encode(&mut self, unit: &RawAudioFrame) -> anyhow::Result<()> {
        if self.next_pts.is_none() {
            // Encoder priming can put the first samples before zero.
            let start = unit
                .pts()
                .map(|pts| pts.rescale(unit.time_base(), self.time_base()))
                .unwrap_or(0);
            self.next_pts = Some(start.max(0));
        }

        let input = unit.as_audio();
        if !self.resampler.as_ref().is_some_and(|r| r.accepts(input)) {
            self.resampler = Some(Resampler::get(
                input.format(),
                channel_layout(input),
                input.rate(),
                AUDIO_ENCODE_FORMAT,
                self.layout,
                self.rate,
            )?);
        }

        let capacity = (input.samples() as u64 * self.rate as u64 / input.rate().max(1) as u64)
            as usize
            + RESAMPLE_SLACK;
        let mut converted = frame::Audio::new(AUDIO_ENCODE_FORMAT, capacity, self.layout);
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.run(input, &mut converted)?;
        }
        self.fifo.push(&converted);
        self.send_full_frames(false)
    }

    fn send_full_frames(&mut self, flush: bool) -> anyhow::Result<()> {
        let frame_size = self.encoder.frame_size();
        while self.fifo.len() >= frame_size || (flush && self.fifo.len() > 0) {
            let mut frame = frame::Audio::new(AUDIO_ENCODE_FORMAT, frame_size, self.layout);
            frame.set_rate(self.rate);
            self.fifo.pop_into(&mut frame);

            let pts = self.next_pts.unwrap_or(0);
            frame.set_pts(Some(pts));
            self.next_pts = Some(pts + frame_size as i64);

            self.encoder.send_audio(&frame)?;
            drain_packets(&mut self.encoder, &self.port)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(resampler) = self.resampler.as_mut() {
            loop {
                let mut tail = frame::Audio::new(AUDIO_ENCODE_FORMAT, RESAMPLE_FLUSH_CHUNK, self.layout);
                if !resampler.flush(&mut tail)? {
                    break;
                }
                self.fifo.push(&tail);
            }
        }
        self.send_full_frames(true)?;
        self.encoder.send_eof()?;
        drain_packets(&mut self.encoder, &self.port)?;
        log::debug!("audio input finished at sample {}", self.next_pts.unwrap_or(0));
        Ok(())
    }
}

impl LaneSink for AudioWriterInput {
    type Unit = RawAudioFrame;

    fn is_ready(&self) -> bool {
        self.port.is_ready()
    }

    fn append(&mut self, unit: RawAudioFrame) -> TranscodeResult<()> {
        self.encode(&unit)
            .map_err(|e| TranscodeError::lane(LaneKind::Audio, e))
    }

    fn mark_finished(&mut self) -> TranscodeResult<()> {
        self.finish()
            .map_err(|e| TranscodeError::lane(LaneKind::Audio, e))
    }

    fn ready_signal(&self) -> Arc<ReadySignal> {
        self.port.ready_signal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planar(samples: &[&[f32]]) -> frame::Audio {
        let layout = ChannelLayout::default(samples.len() as i32);
        let mut frame = frame::Audio::new(AUDIO_ENCODE_FORMAT, samples[0].len(), layout);
        for (index, values) in samples.iter().enumerate() {
            frame.plane_mut::<f32>(index).copy_from_slice(values);
        }
        frame
    }

    #[test]
    fn test_fifo_cuts_and_pads_frames() -> anyhow::Result<()> {
        ffmpeg_next::init()?;
        let mut fifo = SampleFifo::new(2);
        fifo.push(&planar(&[&[1.0, 2.0, 3.0], &[-1.0, -2.0, -3.0]]));
        assert_eq!(fifo.len(), 3);

        let layout = ChannelLayout::default(2);
        let mut first = frame::Audio::new(AUDIO_ENCODE_FORMAT, 2, layout);
        fifo.pop_into(&mut first);
        assert_eq!(first.plane::<f32>(0), &[1.0, 2.0]);
        assert_eq!(first.plane::<f32>(1), &[-1.0, -2.0]);

        let mut tail = frame::Audio::new(AUDIO_ENCODE_FORMAT, 2, layout);
        fifo.pop_into(&mut tail);
        assert_eq!(tail.plane::<f32>(0), &[3.0, 0.0]);
        assert_eq!(tail.plane::<f32>(1), &[-3.0, 0.0]);
        assert_eq!(fifo.len(), 0);
        Ok(())
    }
}

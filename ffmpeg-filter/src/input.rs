use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use ffmpeg_next::{
    Packet, Rational, Rescale,
    format::{Pixel, Sample, sample},
    frame, media,
};
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    decoder::{Decoder, Receive},
    error::{TranscodeError, TranscodeResult},
    frame::{RawAudioFrame, RawVideoFrame},
    lane::{LaneKind, LaneSource},
    scaler::{RESAMPLE_FLUSH_CHUNK, RESAMPLE_SLACK, Resampler, Scaler, channel_layout},
    stream::AvTrack,
};

/// Pixel format of decoded video handed to the transform stage.
pub const VIDEO_READ_FORMAT: Pixel = Pixel::NV12;
/// Sample format of decoded audio handed to the audio writer input.
pub const AUDIO_READ_FORMAT: Sample = Sample::I16(sample::Type::Packed);

/// Packets of one track that may wait for their lane before the reader stalls.
pub const MAX_PENDING_PACKETS: usize = 64;

struct Demux {
    context: ffmpeg_next::format::context::Input,
    pending: HashMap<usize, VecDeque<Packet>>,
    exhausted: bool,
}

unsafe impl Send for Demux {}

impl Demux {
    fn pop(&mut self, stream_index: usize) -> Option<Packet> {
        self.pending
            .get_mut(&stream_index)
            .and_then(|queue| queue.pop_front())
    }

    /// Another registered track has a full queue, so reading on would grow it.
    fn backlogged(&self, stream_index: usize) -> bool {
        self.pending
            .iter()
            .any(|(index, queue)| *index != stream_index && queue.len() >= MAX_PENDING_PACKETS)
    }

    /// Reads one packet from the container and parks it in its track's queue.
    /// Packets of unregistered tracks are dropped.
    fn read_one(&mut self) {
        let next = self
            .context
            .packets()
            .next()
            .map(|(stream, packet)| (stream.index(), packet));
        match next {
            Some((index, packet)) => {
                if let Some(queue) = self.pending.get_mut(&index) {
                    queue.push_back(packet);
                }
            }
            None => {
                log::debug!("end of source container");
                self.exhausted = true;
            }
        }
    }
}

struct Shared {
    demux: Mutex<Demux>,
    drained: Condvar,
}

/// Shared, lockable view of the source container. Each track output pulls its
/// own stream through it; cloning is cheap. A lane that would read past a full
/// queue of the other track waits until that track's lane catches up.
#[derive(Clone)]
pub struct DemuxHandle {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl DemuxHandle {
    fn next_packet(&self, stream_index: usize) -> Option<Packet> {
        let mut demux = self.shared.demux.lock();
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(packet) = demux.pop(stream_index) {
                self.shared.drained.notify_all();
                return Some(packet);
            }
            if demux.exhausted {
                return None;
            }
            if demux.backlogged(stream_index) {
                self.shared.drained.wait(&mut demux);
                continue;
            }
            demux.read_one();
        }
    }

    fn register(&self, stream_index: usize) {
        self.shared
            .demux
            .lock()
            .pending
            .entry(stream_index)
            .or_default();
    }

    /// Forgets a track whose output went away, so its queue cannot stall the others.
    fn release(&self, stream_index: usize) {
        self.shared.demux.lock().pending.remove(&stream_index);
        self.shared.drained.notify_all();
    }

    #[cfg(test)]
    fn pending_len(&self, stream_index: usize) -> usize {
        self.shared
            .demux
            .lock()
            .pending
            .get(&stream_index)
            .map_or(0, VecDeque::len)
    }

    /// Stops reading. Pending packets are dropped, waiting lanes wake up and
    /// every later pull reports end of track. Safe to call more than once.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let mut demux = self.shared.demux.lock();
        demux.pending.values_mut().for_each(VecDeque::clear);
        demux.exhausted = true;
        self.shared.drained.notify_all();
        log::debug!("source reading cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An opened source asset: the selected video track, the optional audio track
/// and their decoders.
pub struct AvInput {
    handle: DemuxHandle,
    duration: Option<f64>,
    bit_rate: usize,
    video: AvTrack,
    audio: Option<AvTrack>,
    video_decoder: Option<Decoder>,
    audio_decoder: Option<Decoder>,
}

impl AvInput {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let context = ffmpeg_next::format::input(path)
            .with_context(|| format!("opening {}", path.display()))?;

        let video: AvTrack = context
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("no video stream"))?
            .into();
        let video_decoder = Decoder::new(&video).context("opening video decoder")?;
        log::info!(
            "video track {}: {}x{} at {:.3} fps, time base {}, rotation {:.1}",
            video.index(),
            video.width(),
            video.height(),
            video.fps(),
            video.time_base(),
            video.transform().degrees()
        );

        let mut audio: Option<AvTrack> = context.streams().best(media::Type::Audio).map(Into::into);
        let audio_decoder = match &audio {
            Some(track) => match Decoder::new(track) {
                Ok(decoder) => {
                    log::info!(
                        "audio track {}: {} Hz, {} channels",
                        track.index(),
                        track.sample_rate(),
                        track.channels()
                    );
                    Some(decoder)
                }
                Err(e) => {
                    log::warn!("ignoring audio track {}: {:#}", track.index(), e);
                    None
                }
            },
            None => None,
        };
        if audio_decoder.is_none() {
            audio = None;
        }

        let duration = match context.duration() {
            d if d <= 0 => None,
            d => Some(d as f64 / ffmpeg_next::ffi::AV_TIME_BASE as f64),
        };
        let bit_rate = context.bit_rate().max(0) as usize;

        Ok(Self {
            handle: DemuxHandle {
                shared: Arc::new(Shared {
                    demux: Mutex::new(Demux {
                        context,
                        pending: HashMap::new(),
                        exhausted: false,
                    }),
                    drained: Condvar::new(),
                }),
                cancel: CancellationToken::new(),
            },
            duration,
            bit_rate,
            video,
            audio,
            video_decoder: Some(video_decoder),
            audio_decoder,
        })
    }

    /// Container duration in seconds, if known.
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Container bit rate in bits per second; 0 if unknown.
    pub fn bit_rate(&self) -> usize {
        self.bit_rate
    }

    pub fn video_track(&self) -> &AvTrack {
        &self.video
    }

    pub fn audio_track(&self) -> Option<&AvTrack> {
        self.audio.as_ref()
    }

    pub fn handle(&self) -> DemuxHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Decoded video output. Can be taken once.
    pub fn video_output(&mut self) -> anyhow::Result<VideoTrackOutput> {
        let decoder = self
            .video_decoder
            .take()
            .ok_or_else(|| anyhow::anyhow!("video output already taken"))?;
        self.handle.register(self.video.index());
        Ok(VideoTrackOutput {
            demux: self.handle.clone(),
            track: self.video.clone(),
            decoder,
            scaler: None,
            done: false,
        })
    }

    /// Decoded audio output resampled to `read_rate`. `None` without an audio
    /// track, or once taken.
    pub fn audio_output(&mut self, read_rate: u32) -> Option<AudioTrackOutput> {
        let decoder = self.audio_decoder.take()?;
        let track = self.audio.clone()?;
        self.handle.register(track.index());
        Some(AudioTrackOutput {
            demux: self.handle.clone(),
            track,
            decoder,
            resampler: None,
            read_rate,
            next_pts: None,
            done: false,
        })
    }
}

/// Pull interface over the video track, yielding NV12 frames.
pub struct VideoTrackOutput {
    demux: DemuxHandle,
    track: AvTrack,
    decoder: Decoder,
    scaler: Option<Scaler>,
    done: bool,
}

impl Drop for VideoTrackOutput {
    fn drop(&mut self) {
        self.demux.release(self.track.index());
    }
}

impl VideoTrackOutput {
    fn next_frame(&mut self) -> anyhow::Result<Option<RawVideoFrame>> {
        loop {
            if self.done || self.demux.is_cancelled() {
                self.done = true;
                return Ok(None);
            }
            match self.decoder.receive_video()? {
                Receive::Frame(frame) => return self.convert(frame).map(Some),
                Receive::Eof => {
                    self.done = true;
                    return Ok(None);
                }
                Receive::Again if self.decoder.is_flushing() => {
                    self.done = true;
                    return Ok(None);
                }
                Receive::Again => match self.demux.next_packet(self.track.index()) {
                    Some(packet) => {
                        if let Err(e) = self.decoder.send_packet(&packet) {
                            log::warn!("skipping undecodable video packet: {}", e);
                        }
                    }
                    None => self.decoder.send_eof()?,
                },
            }
        }
    }

    fn convert(&mut self, frame: frame::Video) -> anyhow::Result<RawVideoFrame> {
        let pts = frame.timestamp().or(frame.pts());
        if frame.format() == VIDEO_READ_FORMAT {
            let mut frame = frame;
            frame.set_pts(pts);
            return Ok(RawVideoFrame::new(frame, self.track.time_base()));
        }

        if !self.scaler.as_ref().is_some_and(|s| s.accepts(&frame)) {
            self.scaler = Some(Scaler::get(
                frame.format(),
                frame.width(),
                frame.height(),
                VIDEO_READ_FORMAT,
                frame.width(),
                frame.height(),
            )?);
        }
        let mut converted = frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(&frame, &mut converted)?;
        }
        converted.set_pts(pts);
        Ok(RawVideoFrame::new(converted, self.track.time_base()))
    }
}

impl LaneSource for VideoTrackOutput {
    type Unit = RawVideoFrame;

    fn copy_next(&mut self) -> TranscodeResult<Option<RawVideoFrame>> {
        self.next_frame()
            .map_err(|e| TranscodeError::lane(LaneKind::Video, e))
    }
}

/// Pull interface over the audio track, yielding packed S16 PCM at a fixed
/// rate. Timestamps are in `1/read_rate` and continue from the first frame.
pub struct AudioTrackOutput {
    demux: DemuxHandle,
    track: AvTrack,
    decoder: Decoder,
    resampler: Option<Resampler>,
    read_rate: u32,
    next_pts: Option<i64>,
    done: bool,
}

impl Drop for AudioTrackOutput {
    fn drop(&mut self) {
        self.demux.release(self.track.index());
    }
}

impl AudioTrackOutput {
    pub fn time_base(&self) -> Rational {
        Rational::new(1, self.read_rate as i32)
    }

    fn next_frame(&mut self) -> anyhow::Result<Option<RawAudioFrame>> {
        loop {
            if self.done || self.demux.is_cancelled() {
                self.done = true;
                return Ok(None);
            }
            match self.decoder.receive_audio()? {
                Receive::Frame(frame) => {
                    if let Some(out) = self.convert(&frame)? {
                        return Ok(Some(out));
                    }
                }
                Receive::Eof => return self.drain_resampler(),
                Receive::Again if self.decoder.is_flushing() => return self.drain_resampler(),
                Receive::Again => match self.demux.next_packet(self.track.index()) {
                    Some(packet) => {
                        if let Err(e) = self.decoder.send_packet(&packet) {
                            log::warn!("skipping undecodable audio packet: {}", e);
                        }
                    }
                    None => self.decoder.send_eof()?,
                },
            }
        }
    }

    fn stamp(&mut self, mut out: frame::Audio) -> RawAudioFrame {
        let pts = self.next_pts.unwrap_or(0);
        out.set_pts(Some(pts));
        self.next_pts = Some(pts + out.samples() as i64);
        RawAudioFrame::new(out, self.time_base())
    }

    fn convert(&mut self, frame: &frame::Audio) -> anyhow::Result<Option<RawAudioFrame>> {
        if self.next_pts.is_none() {
            self.next_pts = Some(
                frame
                    .timestamp()
                    .or(frame.pts())
                    .map(|pts| pts.rescale(self.track.time_base(), self.time_base()))
                    .unwrap_or(0),
            );
        }

        if !self.resampler.as_ref().is_some_and(|r| r.accepts(frame)) {
            let layout = channel_layout(frame);
            self.resampler = Some(Resampler::get(
                frame.format(),
                layout,
                frame.rate(),
                AUDIO_READ_FORMAT,
                layout,
                self.read_rate,
            )?);
        }

        let capacity = (frame.samples() as u64 * self.read_rate as u64
            / frame.rate().max(1) as u64) as usize
            + RESAMPLE_SLACK;
        let mut out = frame::Audio::new(AUDIO_READ_FORMAT, capacity, channel_layout(frame));
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.run(frame, &mut out)?;
        }
        if out.samples() == 0 {
            return Ok(None);
        }
        Ok(Some(self.stamp(out)))
    }

    /// Emits what swresample still buffers, then reports end of track.
    fn drain_resampler(&mut self) -> anyhow::Result<Option<RawAudioFrame>> {
        let Some(resampler) = self.resampler.as_mut() else {
            self.done = true;
            return Ok(None);
        };
        let layout = resampler.output_layout();
        let mut out = frame::Audio::new(AUDIO_READ_FORMAT, RESAMPLE_FLUSH_CHUNK, layout);
        if resampler.flush(&mut out)? {
            return Ok(Some(self.stamp(out)));
        }
        self.done = true;
        Ok(None)
    }
}

impl LaneSource for AudioTrackOutput {
    type Unit = RawAudioFrame;

    fn copy_next(&mut self) -> TranscodeResult<Option<RawAudioFrame>> {
        self.next_frame()
            .map_err(|e| TranscodeError::lane(LaneKind::Audio, e))
    }
}

//! Pipeline entry: one source in, one filtered output file (or an error) out.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    completion::CompletionSynchronizer,
    encoder::{AudioSettings, Encoder, VideoSettings},
    error::{TranscodeError, TranscodeResult},
    frame::FrameImage,
    geometry::OutputGeometry,
    input::{AvInput, DemuxHandle},
    lane::{Lane, LaneKind, LaneSink, ReadySignal},
    output::{self, AvOutput, MuxHandle},
    sink::{AudioWriterInput, VideoWriterInput},
    transform::{ProcessingFunction, TransformStage},
};

/// Used when neither the video track nor the container reports a bit rate.
const FALLBACK_VIDEO_BIT_RATE: usize = 2_000_000;

#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    /// Directory the output file is created in.
    pub output_dir: PathBuf,
    /// Output file extension; picks the container ("mp4" or "mov").
    pub container: String,
    /// Video encoder looked up by name before falling back to any H.264 encoder.
    pub video_codec: String,
    pub video_preset: Option<String>,
    pub audio_bit_rate: usize,
    /// Rate the audio track is decoded to before re-encoding.
    pub audio_read_rate: u32,
    /// Encoder-input rasters kept for reuse by the video writer input.
    pub pool_size: usize,
    /// Encoded packets a writer input may have queued at the muxer.
    pub writer_window: usize,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir(),
            container: "mp4".to_string(),
            video_codec: "libx264".to_string(),
            video_preset: Some("veryfast".to_string()),
            audio_bit_rate: 128_000,
            audio_read_rate: 44_100,
            pool_size: 3,
            writer_window: 8,
        }
    }
}

type ResultSender = oneshot::Sender<TranscodeResult<PathBuf>>;

/// Hands the result to the caller; only the first delivery gets through.
#[derive(Clone)]
struct Delivery(Arc<Mutex<Option<ResultSender>>>);

impl Delivery {
    fn new(sender: ResultSender) -> Self {
        Self(Arc::new(Mutex::new(Some(sender))))
    }

    fn deliver(&self, result: TranscodeResult<PathBuf>) {
        match self.0.lock().take() {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => log::warn!("transcode result already delivered, dropping {:?}", result),
        }
    }
}

/// Resolves once with the output path or the error that ended the run.
pub struct TranscodeJob {
    receiver: oneshot::Receiver<TranscodeResult<PathBuf>>,
}

impl Future for TranscodeJob {
    type Output = TranscodeResult<PathBuf>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TranscodeError::Dropped)))
    }
}

/// Starts transcoding `source` on the current Tokio runtime, running
/// `processing` on every decoded video frame.
pub fn spawn_transcode(
    source: impl AsRef<Path>,
    processing: ProcessingFunction,
    options: TranscodeOptions,
) -> TranscodeJob {
    let (sender, receiver) = oneshot::channel();
    let delivery = Delivery::new(sender);
    let source = source.as_ref().to_path_buf();
    let runtime = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || start(source, processing, options, runtime, delivery));
    TranscodeJob { receiver }
}

pub async fn transcode(
    source: impl AsRef<Path>,
    processing: ProcessingFunction,
    options: TranscodeOptions,
) -> TranscodeResult<PathBuf> {
    spawn_transcode(source, processing, options).await
}

/// Runs a filter that always produces an image, e.g. one built from
/// `image::imageops`.
pub async fn filter_video<F>(
    source: impl AsRef<Path>,
    filter: F,
    options: TranscodeOptions,
) -> TranscodeResult<PathBuf>
where
    F: Fn(&FrameImage) -> FrameImage + Send + Sync + 'static,
{
    let processing: ProcessingFunction = Arc::new(move |image: FrameImage| Some(filter(&image)));
    transcode(source, processing, options).await
}

struct Writers {
    mux: MuxHandle,
    video: VideoWriterInput,
    audio: Option<AudioWriterInput>,
}

fn video_bit_rate(input: &AvInput) -> usize {
    match (input.video_track().bit_rate(), input.bit_rate()) {
        (0, 0) => FALLBACK_VIDEO_BIT_RATE,
        (0, container) => container,
        (track, _) => track,
    }
}

fn create_writers(
    input: &AvInput,
    geometry: &OutputGeometry,
    destination: &Path,
    options: &TranscodeOptions,
    runtime: &tokio::runtime::Handle,
) -> anyhow::Result<Writers> {
    let mut output = AvOutput::create(destination)?;
    let global_header = output.global_header();

    let track = input.video_track();
    let rate = track.rate();
    let video_encoder = Encoder::video(&VideoSettings {
        width: geometry.width,
        height: geometry.height,
        time_base: track.time_base(),
        frame_rate: (rate.numerator() > 0 && rate.denominator() > 0).then_some(rate),
        bit_rate: video_bit_rate(input),
        codec: options.video_codec.clone(),
        preset: options.video_preset.clone(),
        global_header,
    })?;
    let video_port = output.add_input(&video_encoder, Some(geometry.transform), options.writer_window)?;
    let video = VideoWriterInput::new(
        video_encoder,
        video_port,
        geometry.width,
        geometry.height,
        options.pool_size,
    );

    let audio = match input.audio_track() {
        Some(track) => {
            let audio_encoder = Encoder::audio(&AudioSettings {
                rate: track.sample_rate(),
                channels: track.channels(),
                bit_rate: options.audio_bit_rate,
                global_header,
            })?;
            let audio_port = output.add_input(&audio_encoder, None, options.writer_window)?;
            Some(AudioWriterInput::new(
                audio_encoder,
                audio_port,
                track.sample_rate(),
                track.channels(),
            ))
        }
        None => None,
    };

    let mux = output.start_writing(runtime)?;
    Ok(Writers { mux, video, audio })
}

/// Everything needed to stop a failing run.
struct Teardown {
    sync: Arc<CompletionSynchronizer>,
    cancel: CancellationToken,
    signals: Vec<Arc<ReadySignal>>,
    demux: DemuxHandle,
    mux: MuxHandle,
    delivery: Delivery,
}

impl Teardown {
    fn fail(&self, error: TranscodeError) {
        if !self.sync.fail() {
            log::warn!("ignoring failure after the run ended: {}", error);
            return;
        }
        let path = self.mux.path().display();
        match std::error::Error::source(&error) {
            Some(cause) => log::error!("transcode to {} failed: {}: {:#}", path, error, cause),
            None => log::error!("transcode to {} failed: {}", path, error),
        }
        self.cancel.cancel();
        self.signals.iter().for_each(|signal| signal.close());
        self.demux.cancel();
        self.mux.abort();
        self.delivery.deliver(Err(error));
    }
}

fn start(
    source: PathBuf,
    processing: ProcessingFunction,
    options: TranscodeOptions,
    runtime: tokio::runtime::Handle,
    delivery: Delivery,
) {
    let started = Instant::now();
    let mut input = match AvInput::open(&source) {
        Ok(input) => input,
        Err(e) => {
            log::error!("cannot open {}: {:#}", source.display(), e);
            delivery.deliver(Err(TranscodeError::SourceOpen {
                path: source,
                source: e,
            }));
            return;
        }
    };

    match input.duration() {
        Some(seconds) => log::info!("transcoding {} ({:.2}s)", source.display(), seconds),
        None => log::info!("transcoding {} (duration unknown)", source.display()),
    }
    let track = input.video_track();
    let geometry = OutputGeometry::normalize(track.width(), track.height(), track.transform());
    log::info!(
        "output geometry {}x{} ({:?}, bake in: {})",
        geometry.width,
        geometry.height,
        geometry.rotation,
        geometry.bake_in
    );

    let destination = output::destination_path(&options.output_dir, &options.container);
    let writers = match create_writers(&input, &geometry, &destination, &options, &runtime) {
        Ok(writers) => writers,
        Err(e) => {
            log::error!("cannot create {}: {:#}", destination.display(), e);
            if destination.exists() {
                let _ = std::fs::remove_file(&destination);
            }
            input.cancel();
            delivery.deliver(Err(TranscodeError::OutputCreate {
                path: destination,
                source: e,
            }));
            return;
        }
    };
    let Writers { mux, video, audio } = writers;

    let demux = input.handle();
    let video_source = match input.video_output() {
        Ok(output) => TransformStage::new(output, processing, geometry.bake_in),
        Err(e) => {
            mux.abort();
            input.cancel();
            delivery.deliver(Err(TranscodeError::lane(LaneKind::Video, e)));
            return;
        }
    };
    let audio_lane_parts = match (input.audio_output(options.audio_read_rate), audio) {
        (Some(source), Some(sink)) => Some((source, sink)),
        _ => None,
    };
    drop(input);

    let finalizer = {
        let mux = mux.clone();
        let demux = demux.clone();
        let delivery = delivery.clone();
        let destination = destination.clone();
        move || {
            let result = match mux.finish() {
                Ok(()) => {
                    log::info!(
                        "transcode of {} finished in {:.2?}",
                        source.display(),
                        started.elapsed()
                    );
                    Ok(destination)
                }
                Err(e) => {
                    log::error!("cannot finalize {}: {:#}", destination.display(), e);
                    let _ = std::fs::remove_file(&destination);
                    Err(TranscodeError::Finalize {
                        path: destination,
                        source: e,
                    })
                }
            };
            demux.cancel();
            delivery.deliver(result);
        }
    };
    let sync = Arc::new(CompletionSynchronizer::new(audio_lane_parts.is_some(), finalizer));

    let cancel = CancellationToken::new();
    let mut signals = vec![video.ready_signal()];
    if let Some((_, sink)) = &audio_lane_parts {
        signals.push(sink.ready_signal());
    }
    let teardown = Arc::new(Teardown {
        sync: sync.clone(),
        cancel: cancel.clone(),
        signals,
        demux,
        mux,
        delivery,
    });

    let video_lane = Lane::new(LaneKind::Video, video_source, video, cancel.clone());
    spawn_lane(&runtime, sync.clone(), teardown.clone(), move |sync| video_lane.run(sync));

    if let Some((source, sink)) = audio_lane_parts {
        let audio_lane = Lane::new(LaneKind::Audio, source, sink, cancel);
        spawn_lane(&runtime, sync, teardown, move |sync| audio_lane.run(sync));
    }
}

fn spawn_lane<F>(
    runtime: &tokio::runtime::Handle,
    sync: Arc<CompletionSynchronizer>,
    teardown: Arc<Teardown>,
    run: F,
) where
    F: FnOnce(&CompletionSynchronizer) -> TranscodeResult<()> + Send + 'static,
{
    runtime.spawn_blocking(move || {
        if let Err(e) = run(&sync) {
            teardown.fail(e);
        }
    });
}

#[cfg(test)]
#[path = "transcode_test.rs"]
mod transcode_test;

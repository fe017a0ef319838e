use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;

use anyhow::Context as _;
use ffmpeg_next::{Packet, Rational, format};
use parking_lot::Mutex;

use crate::{encoder::Encoder, geometry::Transform, lane::ReadySignal};

/// Bounded count of encoded packets a writer input has handed to the mux
/// worker but the worker has not written yet.
pub struct InputWindow {
    in_flight: AtomicUsize,
    capacity: usize,
    ready: Arc<ReadySignal>,
}

impl InputWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            capacity: capacity.max(1),
            ready: Arc::new(ReadySignal::new()),
        }
    }

    pub fn has_room(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) < self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.ready.raise();
    }

    pub fn ready_signal(&self) -> Arc<ReadySignal> {
        self.ready.clone()
    }
}

enum MuxCommand {
    Packet {
        stream: usize,
        packet: Packet,
        time_base: Rational,
    },
    Finish(tokio::sync::oneshot::Sender<anyhow::Result<()>>),
    Abort(tokio::sync::oneshot::Sender<()>),
}

/// Sending end of one output stream, owned by its writer input.
pub struct WriterPort {
    stream_index: usize,
    time_base: Rational,
    window: Arc<InputWindow>,
    sender: mpsc::Sender<MuxCommand>,
    failed: Arc<AtomicBool>,
}

impl WriterPort {
    pub fn is_ready(&self) -> bool {
        self.window.has_room()
    }

    pub fn ready_signal(&self) -> Arc<ReadySignal> {
        self.window.ready_signal()
    }

    /// Hands an encoded packet, timestamped in the encoder's time base, to the
    /// mux worker.
    pub fn send(&self, packet: Packet) -> anyhow::Result<()> {
        if self.failed.load(Ordering::Acquire) {
            anyhow::bail!("muxer failed, stream {} stopped", self.stream_index);
        }
        self.window.acquire();
        let command = MuxCommand::Packet {
            stream: self.stream_index,
            packet,
            time_base: self.time_base,
        };
        if self.sender.send(command).is_err() {
            self.window.release();
            anyhow::bail!("muxer stopped, stream {} stopped", self.stream_index);
        }
        Ok(())
    }
}

/// Output container being set up. Streams are added before
/// [`AvOutput::start_writing`]; after that only the mux worker touches the
/// container.
pub struct AvOutput {
    path: PathBuf,
    inner: format::context::Output,
    windows: Vec<Arc<InputWindow>>,
    sender: mpsc::Sender<MuxCommand>,
    receiver: mpsc::Receiver<MuxCommand>,
    failed: Arc<AtomicBool>,
}

unsafe impl Send for AvOutput {}

impl AvOutput {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let inner = format::output(path).with_context(|| format!("creating {}", path.display()))?;
        let (sender, receiver) = mpsc::channel();
        Ok(Self {
            path: path.to_path_buf(),
            inner,
            windows: Vec::new(),
            sender,
            receiver,
            failed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether encoders must put codec headers in extradata for this container.
    pub fn global_header(&self) -> bool {
        self.inner
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER)
    }

    /// Adds an output stream fed by `encoder`. A non-identity `transform` is
    /// stored as the stream's display matrix.
    pub fn add_input(
        &mut self,
        encoder: &Encoder,
        transform: Option<Transform>,
        window: usize,
    ) -> anyhow::Result<WriterPort> {
        let mut ost = self.inner.add_stream(encoder.codec())?;
        ost.set_parameters(encoder.parameters());
        ost.set_time_base(encoder.time_base());
        let stream_index = ost.index();

        if let Some(transform) = transform.filter(|t| !t.is_identity()) {
            let matrix = transform.to_display_matrix();
            unsafe {
                let par = (*ost.as_mut_ptr()).codecpar;
                let side_data = ffmpeg_next::ffi::av_packet_side_data_new(
                    &mut (*par).coded_side_data,
                    &mut (*par).nb_coded_side_data,
                    ffmpeg_next::ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
                    size_of::<[i32; 9]>(),
                    0,
                );
                if side_data.is_null() {
                    anyhow::bail!("cannot attach display matrix to stream {}", stream_index);
                }
                std::ptr::copy_nonoverlapping(
                    matrix.as_ptr() as *const u8,
                    (*side_data).data,
                    size_of::<[i32; 9]>(),
                );
            }
            log::info!(
                "stream {} carries display rotation {:.1}",
                stream_index,
                transform.degrees()
            );
        }

        let window = Arc::new(InputWindow::new(window));
        self.windows.push(window.clone());
        Ok(WriterPort {
            stream_index,
            time_base: encoder.time_base(),
            window,
            sender: self.sender.clone(),
            failed: self.failed.clone(),
        })
    }

    /// Writes the header and hands the container to a mux worker on the
    /// runtime's blocking pool.
    pub fn start_writing(mut self, runtime: &tokio::runtime::Handle) -> anyhow::Result<MuxHandle> {
        self.inner.write_header()?;

        let mut streams = Vec::with_capacity(self.windows.len());
        for (index, window) in self.windows.iter().enumerate() {
            let time_base = self
                .inner
                .stream(index)
                .ok_or_else(|| anyhow::anyhow!("output stream {} missing", index))?
                .time_base();
            streams.push((time_base, window.clone()));
        }

        let handle = MuxHandle {
            path: self.path.clone(),
            sender: self.sender.clone(),
        };
        let Self {
            path,
            inner,
            receiver,
            failed,
            ..
        } = self;
        log::info!("writing {}", path.display());
        runtime.spawn_blocking(move || mux_loop(inner, path, receiver, streams, failed));
        Ok(handle)
    }
}

fn mux_loop(
    mut octx: format::context::Output,
    path: PathBuf,
    receiver: mpsc::Receiver<MuxCommand>,
    streams: Vec<(Rational, Arc<InputWindow>)>,
    failed: Arc<AtomicBool>,
) {
    let mut error: Option<anyhow::Error> = None;
    let mut aborted = None;
    while let Ok(command) = receiver.recv() {
        match command {
            MuxCommand::Packet {
                stream,
                mut packet,
                time_base,
            } => {
                let Some((out_time_base, window)) = streams.get(stream) else {
                    log::error!("packet for unknown output stream {}", stream);
                    continue;
                };
                if error.is_none() {
                    packet.set_stream(stream);
                    packet.set_position(-1);
                    packet.rescale_ts(time_base, *out_time_base);
                    if let Err(e) = packet.write_interleaved(&mut octx) {
                        log::error!("write packet to {} failed: {}", path.display(), e);
                        failed.store(true, Ordering::Release);
                        error = Some(e.into());
                    }
                }
                window.release();
            }
            MuxCommand::Finish(reply) => {
                let result = match error.take() {
                    Some(e) => Err(e),
                    None => octx.write_trailer().map_err(Into::into),
                };
                if result.is_ok() {
                    log::info!("finished {}", path.display());
                }
                let _ = reply.send(result);
                return;
            }
            MuxCommand::Abort(reply) => {
                aborted = Some(reply);
                break;
            }
        }
    }

    drop(octx);
    match std::fs::remove_file(&path) {
        Ok(()) => log::info!("removed partial output {}", path.display()),
        Err(e) => log::warn!("cannot remove partial output {}: {}", path.display(), e),
    }
    if let Some(reply) = aborted {
        let _ = reply.send(());
    }
}

/// Control handle of a running mux worker.
#[derive(Clone)]
pub struct MuxHandle {
    path: PathBuf,
    sender: mpsc::Sender<MuxCommand>,
}

impl MuxHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the trailer once every packet sent so far is written. Blocks the
    /// calling thread; must not run on an async worker.
    pub fn finish(&self) -> anyhow::Result<()> {
        let (reply, response) = tokio::sync::oneshot::channel();
        self.sender
            .send(MuxCommand::Finish(reply))
            .map_err(|_| anyhow::anyhow!("muxer already stopped"))?;
        response
            .blocking_recv()
            .map_err(|_| anyhow::anyhow!("muxer stopped before writing trailer"))?
    }

    /// Drops the container without a trailer and removes the file. Blocks
    /// until the file is gone; returns at once if the worker already stopped.
    pub fn abort(&self) {
        let (reply, response) = tokio::sync::oneshot::channel();
        if self.sender.send(MuxCommand::Abort(reply)).is_ok() {
            let _ = response.blocking_recv();
        }
    }
}

static LAST_STAMP: Mutex<i64> = Mutex::new(0);

/// Fresh output path in `dir`, named after the current local time with
/// microsecond resolution. Names never repeat within a process and never
/// collide with an existing file.
pub fn destination_path(dir: &Path, extension: &str) -> PathBuf {
    let mut last = LAST_STAMP.lock();
    let mut micros = chrono::Local::now().timestamp_micros().max(*last + 1);
    loop {
        let stamp = chrono::DateTime::from_timestamp_micros(micros)
            .map(|t| t.with_timezone(&chrono::Local).format("%Y%m%d-%H%M%S-%6f").to_string())
            .unwrap_or_else(|| micros.to_string());
        let path = dir.join(format!("{}.{}", stamp, extension));
        if !path.exists() {
            *last = micros;
            return path;
        }
        micros += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_paths_are_unique() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let first = destination_path(dir.path(), "mp4");
        std::fs::write(&first, b"")?;
        let second = destination_path(dir.path(), "mp4");
        let third = destination_path(dir.path(), "mov");

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(second.extension().and_then(|e| e.to_str()), Some("mp4"));
        assert_eq!(third.extension().and_then(|e| e.to_str()), Some("mov"));
        assert!(second.starts_with(dir.path()));
        Ok(())
    }

    #[test]
    fn test_window_release_raises_ready() {
        let window = InputWindow::new(2);
        window.acquire();
        window.acquire();
        assert!(!window.has_room());

        window.release();
        assert!(window.has_room());
        assert!(window.ready_signal().wait());
        assert_eq!(window.in_flight(), 1);
    }
}

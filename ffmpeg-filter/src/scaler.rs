use ffmpeg_next::{
    ChannelLayout,
    format::{Pixel, Sample},
    frame,
    software::{resampling, scaling},
};

/// swscale context that remembers its input geometry so callers can rebuild
/// it when the incoming frames change size or format.
pub struct Scaler {
    context: scaling::Context,
    input: (Pixel, u32, u32),
}

impl Scaler {
    pub fn get(
        src_format: Pixel,
        src_width: u32,
        src_height: u32,
        dst_format: Pixel,
        dst_width: u32,
        dst_height: u32,
    ) -> anyhow::Result<Self> {
        let context = scaling::Context::get(
            src_format,
            src_width,
            src_height,
            dst_format,
            dst_width,
            dst_height,
            scaling::Flags::BILINEAR,
        )?;
        Ok(Self {
            context,
            input: (src_format, src_width, src_height),
        })
    }

    pub fn accepts(&self, frame: &frame::Video) -> bool {
        self.input == (frame.format(), frame.width(), frame.height())
    }

    pub fn run(&mut self, frame: &frame::Video, dst: &mut frame::Video) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}

/// Extra room per resampled frame for samples swresample kept back last time.
pub const RESAMPLE_SLACK: usize = 256;
/// Output frame size used while draining a resampler.
pub const RESAMPLE_FLUSH_CHUNK: usize = 4096;

/// swresample context, keyed the same way as [`Scaler`].
pub struct Resampler {
    context: resampling::Context,
    input: (Sample, ChannelLayout, u32),
    output_layout: ChannelLayout,
}

impl Resampler {
    pub fn get(
        src_format: Sample,
        src_layout: ChannelLayout,
        src_rate: u32,
        dst_format: Sample,
        dst_layout: ChannelLayout,
        dst_rate: u32,
    ) -> anyhow::Result<Self> {
        let context = resampling::Context::get(
            src_format, src_layout, src_rate, dst_format, dst_layout, dst_rate,
        )?;
        Ok(Self {
            context,
            input: (src_format, src_layout, src_rate),
            output_layout: dst_layout,
        })
    }

    pub fn output_layout(&self) -> ChannelLayout {
        self.output_layout
    }

    pub fn accepts(&self, frame: &frame::Audio) -> bool {
        self.input == (frame.format(), channel_layout(frame), frame.rate())
    }

    pub fn run(&mut self, frame: &frame::Audio, dst: &mut frame::Audio) -> anyhow::Result<()> {
        self.context.run(frame, dst)?;
        Ok(())
    }

    /// Drains samples still buffered inside swresample. Returns false when empty.
    pub fn flush(&mut self, dst: &mut frame::Audio) -> anyhow::Result<bool> {
        self.context.flush(dst)?;
        Ok(dst.samples() > 0)
    }
}

unsafe impl Send for Resampler {}

/// Channel layout of a decoded frame, falling back to the default layout for
/// its channel count when the decoder left the mask unset.
pub fn channel_layout(frame: &frame::Audio) -> ChannelLayout {
    let layout = frame.channel_layout();
    if layout.is_empty() {
        ChannelLayout::default(frame.channels() as i32)
    } else {
        layout
    }
}

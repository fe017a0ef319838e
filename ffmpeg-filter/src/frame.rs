use ffmpeg_next::{Rational, format::Pixel, frame};
use image::RgbaImage;

/// Image handed to the processing function: packed 8-bit RGBA.
pub type FrameImage = RgbaImage;

/// Decoded video frame in the reader's fixed pixel format (NV12), with the
/// presentation timestamp in the source track's time base.
pub struct RawVideoFrame {
    frame: frame::Video,
    time_base: Rational,
}

impl RawVideoFrame {
    pub fn new(frame: frame::Video, time_base: Rational) -> Self {
        Self { frame, time_base }
    }

    pub fn pts(&self) -> Option<i64> {
        self.frame.pts()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn as_video(&self) -> &frame::Video {
        &self.frame
    }
}

/// Decoded audio in the reader's fixed PCM format, passed through untouched.
pub struct RawAudioFrame {
    frame: frame::Audio,
    time_base: Rational,
}

impl RawAudioFrame {
    pub fn new(frame: frame::Audio, time_base: Rational) -> Self {
        Self { frame, time_base }
    }

    pub fn pts(&self) -> Option<i64> {
        self.frame.pts()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn as_audio(&self) -> &frame::Audio {
        &self.frame
    }
}

/// Output of the transform stage, ready for the video writer input.
pub struct TransformedFrame {
    pub image: FrameImage,
    pub pts: Option<i64>,
    pub time_base: Rational,
}

/// Copies an RGBA frame into a tightly packed image, dropping row padding.
pub fn image_from_video(frame: &frame::Video) -> anyhow::Result<FrameImage> {
    if frame.format() != Pixel::RGBA {
        anyhow::bail!("expected rgba frame, got {:?}", frame.format());
    }
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let row = width * 4;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row * height);
    for y in 0..height {
        pixels.extend_from_slice(&data[y * stride..y * stride + row]);
    }
    FrameImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("rgba buffer too small for {}x{}", width, height))
}

/// Copies an image into `frame`, which must be an RGBA frame of the same size.
pub fn image_into_video(image: &FrameImage, frame: &mut frame::Video) -> anyhow::Result<()> {
    if frame.format() != Pixel::RGBA
        || frame.width() != image.width()
        || frame.height() != image.height()
    {
        anyhow::bail!(
            "rgba frame {}x{} {:?} cannot hold {}x{} image",
            frame.width(),
            frame.height(),
            frame.format(),
            image.width(),
            image.height()
        );
    }
    let row = image.width() as usize * 4;
    let stride = frame.stride(0);
    let data = frame.data_mut(0);
    for (y, src) in image.as_raw().chunks_exact(row).enumerate() {
        data[y * stride..y * stride + row].copy_from_slice(src);
    }
    Ok(())
}

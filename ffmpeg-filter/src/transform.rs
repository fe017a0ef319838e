use std::sync::Arc;

use ffmpeg_next::{format::Pixel, frame};

use crate::{
    error::{TranscodeError, TranscodeResult},
    frame::{FrameImage, RawVideoFrame, TransformedFrame, image_from_video},
    lane::{LaneKind, LaneSource},
    scaler::Scaler,
};

/// Caller-supplied per-frame image transformation. `None` aborts the run.
pub type ProcessingFunction = Arc<dyn Fn(FrameImage) -> Option<FrameImage> + Send + Sync>;

/// Sits between the video track output and the video writer input: converts
/// each decoded frame to RGBA, re-orients it when the geometry asks for it and
/// runs the processing function.
pub struct TransformStage<S> {
    source: S,
    processing: ProcessingFunction,
    bake_in: bool,
    scaler: Option<Scaler>,
}

impl<S> TransformStage<S>
where
    S: LaneSource<Unit = RawVideoFrame>,
{
    pub fn new(source: S, processing: ProcessingFunction, bake_in: bool) -> Self {
        Self {
            source,
            processing,
            bake_in,
            scaler: None,
        }
    }

    fn to_image(&mut self, raw: &RawVideoFrame) -> anyhow::Result<FrameImage> {
        let video = raw.as_video();
        if !self.scaler.as_ref().is_some_and(|s| s.accepts(video)) {
            self.scaler = Some(Scaler::get(
                video.format(),
                video.width(),
                video.height(),
                Pixel::RGBA,
                video.width(),
                video.height(),
            )?);
        }
        let mut rgba = frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(video, &mut rgba)?;
        }
        let image = image_from_video(&rgba)?;
        if self.bake_in {
            Ok(image::imageops::rotate90(&image))
        } else {
            Ok(image)
        }
    }
}

impl<S> LaneSource for TransformStage<S>
where
    S: LaneSource<Unit = RawVideoFrame>,
{
    type Unit = TransformedFrame;

    fn copy_next(&mut self) -> TranscodeResult<Option<TransformedFrame>> {
        let Some(raw) = self.source.copy_next()? else {
            return Ok(None);
        };
        let pts = raw.pts();
        let time_base = raw.time_base();
        let image = self
            .to_image(&raw)
            .map_err(|e| TranscodeError::lane(LaneKind::Video, e))?;
        drop(raw);

        match (self.processing)(image) {
            Some(image) => Ok(Some(TransformedFrame {
                image,
                pts,
                time_base,
            })),
            None => {
                log::error!("processing function returned no image at pts {:?}", pts);
                Err(TranscodeError::TransformFailure { pts })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use ffmpeg_next::Rational;
    use parking_lot::Mutex;

    use super::*;

    struct Frames(VecDeque<RawVideoFrame>);

    impl LaneSource for Frames {
        type Unit = RawVideoFrame;

        fn copy_next(&mut self) -> TranscodeResult<Option<RawVideoFrame>> {
            Ok(self.0.pop_front())
        }
    }

    /// NV12 frame with a dark left half and a bright right half.
    fn nv12(width: u32, height: u32, pts: i64) -> RawVideoFrame {
        let mut video = frame::Video::new(Pixel::NV12, width, height);
        let stride = video.stride(0);
        let luma = video.data_mut(0);
        for y in 0..height as usize {
            for x in 0..width as usize {
                luma[y * stride + x] = if x < width as usize / 2 { 16 } else { 235 };
            }
        }
        video.data_mut(1).fill(128);
        video.set_pts(Some(pts));
        RawVideoFrame::new(video, Rational::new(1, 10))
    }

    fn source(frames: impl IntoIterator<Item = RawVideoFrame>) -> Frames {
        Frames(frames.into_iter().collect())
    }

    #[test]
    fn test_processing_sees_rgba_in_presentation_order() -> anyhow::Result<()> {
        ffmpeg_next::init()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let processing: ProcessingFunction = Arc::new(move |image: FrameImage| {
            record.lock().push(image.dimensions());
            Some(image)
        });

        let mut stage = TransformStage::new(source([nv12(32, 16, 0), nv12(32, 16, 1)]), processing, false);
        let first = stage.copy_next()?.ok_or_else(|| anyhow::anyhow!("missing frame"))?;
        let second = stage.copy_next()?.ok_or_else(|| anyhow::anyhow!("missing frame"))?;

        assert_eq!((first.pts, second.pts), (Some(0), Some(1)));
        assert_eq!(first.time_base, Rational::new(1, 10));
        // Dark left half, bright right half.
        assert!(first.image.get_pixel(0, 8).0[0] < 40);
        assert!(first.image.get_pixel(31, 8).0[0] > 215);
        assert_eq!(*seen.lock(), vec![(32, 16), (32, 16)]);
        assert!(stage.copy_next()?.is_none());
        Ok(())
    }

    #[test]
    fn test_bake_in_rotates_clockwise() -> anyhow::Result<()> {
        ffmpeg_next::init()?;
        let processing: ProcessingFunction = Arc::new(|image: FrameImage| Some(image));
        let mut stage = TransformStage::new(source([nv12(32, 16, 0)]), processing, true);

        let frame = stage.copy_next()?.ok_or_else(|| anyhow::anyhow!("missing frame"))?;
        assert_eq!(frame.image.dimensions(), (16, 32));
        // The dark left half ends up on top after a clockwise quarter turn.
        assert!(frame.image.get_pixel(8, 0).0[0] < 40);
        assert!(frame.image.get_pixel(8, 31).0[0] > 215);
        Ok(())
    }

    #[test]
    fn test_missing_image_is_transform_failure() -> anyhow::Result<()> {
        ffmpeg_next::init()?;
        let processing: ProcessingFunction = Arc::new(|_: FrameImage| None);
        let mut stage = TransformStage::new(source([nv12(16, 16, 7)]), processing, false);

        match stage.copy_next() {
            Err(TranscodeError::TransformFailure { pts }) => assert_eq!(pts, Some(7)),
            Err(other) => anyhow::bail!("unexpected error: {}", other),
            Ok(_) => anyhow::bail!("expected a transform failure"),
        }
        Ok(())
    }
}

use clap::ValueEnum;
use ffmpeg_filter::FrameImage;
use image::{DynamicImage, imageops};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilterKind {
    Identity,
    Grayscale,
    Invert,
    Brighten,
    Blur,
}

/// A ready-made per-frame filter built from `image::imageops`.
#[derive(Debug, Clone, Copy)]
pub struct Filter {
    kind: FilterKind,
    brightness: i32,
    sigma: f32,
}

impl Filter {
    pub fn new(kind: FilterKind, brightness: i32, sigma: f32) -> Self {
        Self {
            kind,
            brightness,
            sigma,
        }
    }

    pub fn apply(&self, image: &FrameImage) -> FrameImage {
        match self.kind {
            FilterKind::Identity => image.clone(),
            FilterKind::Grayscale => {
                DynamicImage::ImageLumaA8(imageops::grayscale_alpha(image)).to_rgba8()
            }
            FilterKind::Invert => {
                let mut out = image.clone();
                imageops::invert(&mut out);
                out
            }
            FilterKind::Brighten => imageops::brighten(image, self.brightness),
            FilterKind::Blur => imageops::blur(image, self.sigma),
        }
    }
}

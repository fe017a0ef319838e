use ffmpeg_next::{Rational, codec::Parameters, format::stream, media};

use crate::geometry::Transform;

unsafe impl Send for AvTrack {}
unsafe impl Sync for AvTrack {}

/// Read-only descriptor of one source track, captured when the source is opened.
pub struct AvTrack {
    index: usize,
    medium: media::Type,
    parameters: Parameters,
    time_base: Rational,
    rate: Rational,
    duration: Option<i64>,
    bit_rate: usize,
    width: u32,
    height: u32,
    transform: Transform,
    sample_rate: u32,
    channels: u32,
}

impl AvTrack {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn medium(&self) -> media::Type {
        self.medium
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Nominal frame rate; `0/0` when the container does not know it.
    pub fn rate(&self) -> Rational {
        self.rate
    }

    /// Duration in `time_base` units.
    pub fn duration(&self) -> Option<i64> {
        self.duration
    }

    /// Estimated bit rate in bits per second; 0 if the container has no estimate.
    pub fn bit_rate(&self) -> usize {
        self.bit_rate
    }

    pub fn is_video(&self) -> bool {
        self.medium == media::Type::Video
    }

    pub fn is_audio(&self) -> bool {
        self.medium == media::Type::Audio
    }

    /// Natural (coded display) width, before any display transform.
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Display transform of a video track; identity when the container has none.
    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn fps(&self) -> f64 {
        if self.rate.denominator() == 0 {
            return 0.0;
        }
        self.rate.numerator() as f64 / self.rate.denominator() as f64
    }
}

/// Looks for `AV_PKT_DATA_DISPLAYMATRIX` in the stream's coded side data.
fn display_transform(parameters: &Parameters) -> Option<Transform> {
    use ffmpeg_next::ffi::AVPacketSideDataType;

    unsafe {
        let par = parameters.as_ptr();
        let entries = (*par).coded_side_data;
        if entries.is_null() {
            return None;
        }
        for i in 0..(*par).nb_coded_side_data.max(0) as usize {
            let side_data = &*entries.add(i);
            if side_data.type_ != AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX
                || side_data.data.is_null()
                || (side_data.size as usize) < size_of::<[i32; 9]>()
            {
                continue;
            }
            let mut matrix = [0i32; 9];
            std::ptr::copy_nonoverlapping(
                side_data.data as *const u8,
                matrix.as_mut_ptr() as *mut u8,
                size_of::<[i32; 9]>(),
            );
            return Some(Transform::from_display_matrix(&matrix));
        }
    }
    None
}

impl From<stream::Stream<'_>> for AvTrack {
    fn from(stream: stream::Stream<'_>) -> Self {
        let parameters = stream.parameters();
        let (bit_rate, width, height, sample_rate, channels) = unsafe {
            let ptr = parameters.as_ptr();
            (
                (*ptr).bit_rate.max(0) as usize,
                (*ptr).width.max(0) as u32,
                (*ptr).height.max(0) as u32,
                (*ptr).sample_rate.max(0) as u32,
                (*ptr).ch_layout.nb_channels.max(0) as u32,
            )
        };
        let duration = match stream.duration() {
            d if d == ffmpeg_next::ffi::AV_NOPTS_VALUE as i64 || d < 0 => None,
            d => Some(d),
        };
        let medium = parameters.medium();
        let transform = if medium == media::Type::Video {
            display_transform(&parameters).unwrap_or_default()
        } else {
            Transform::IDENTITY
        };

        Self {
            index: stream.index(),
            medium,
            time_base: stream.time_base(),
            rate: stream.avg_frame_rate(),
            duration,
            bit_rate,
            width,
            height,
            transform,
            sample_rate,
            channels,
            parameters,
        }
    }
}

impl Clone for AvTrack {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            medium: self.medium,
            parameters: self.parameters.clone(),
            time_base: self.time_base,
            rate: self.rate,
            duration: self.duration,
            bit_rate: self.bit_rate,
            width: self.width,
            height: self.height,
            transform: self.transform,
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

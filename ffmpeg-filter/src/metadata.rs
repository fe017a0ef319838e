//! Media file metadata (similar to ffprobe).

use std::fmt;
use std::path::Path;

use anyhow::Context as _;

use crate::{geometry::RotationClass, stream::AvTrack};

/// Format-level info (corresponds to ffprobe format).
#[derive(Debug, Clone)]
pub struct FormatInfo {
    /// Format name, e.g. "mov,mp4,m4a,3gp,3g2,mj2"
    pub format_name: String,
    /// Duration in seconds; None if unknown.
    pub duration_sec: Option<f64>,
    /// Total bitrate in bps; 0 if unknown.
    pub bit_rate: i64,
    pub nb_streams: u32,
}

/// Per-stream info (corresponds to ffprobe stream).
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    /// "video" | "audio" | "subtitle" etc.
    pub codec_type: String,
    /// e.g. "h264", "aac"
    pub codec_name: String,
    /// e.g. "1/15360"
    pub time_base: String,
    /// Stream duration in time_base units; None if unknown.
    pub duration_ts: Option<i64>,
    /// Duration in seconds derived from `duration_ts`.
    pub duration_sec: Option<f64>,
    /// Average frame rate, e.g. "30/1".
    pub rate: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Video only: display rotation from the display matrix, in degrees.
    pub rotation: Option<f64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
}

impl StreamInfo {
    pub fn is_video(&self) -> bool {
        self.codec_type == "video"
    }

    pub fn is_audio(&self) -> bool {
        self.codec_type == "audio"
    }

    /// Width and height as displayed, i.e. swapped for quarter turns.
    pub fn display_size(&self) -> Option<(u32, u32)> {
        let (width, height) = (self.width?, self.height?);
        match self.rotation.map(RotationClass::classify) {
            Some(RotationClass::Quarter | RotationClass::ThreeQuarter) => Some((height, width)),
            _ => Some((width, height)),
        }
    }
}

/// Full probe result (format + streams, like ffprobe).
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub format: FormatInfo,
    pub streams: Vec<StreamInfo>,
}

impl MediaInfo {
    pub fn video(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.is_video())
    }

    pub fn audio(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.is_audio())
    }
}

impl fmt::Display for MediaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[FORMAT]")?;
        writeln!(f, "format_name={}", self.format.format_name)?;
        match self.format.duration_sec {
            Some(d) => writeln!(f, "duration_sec={:.3}", d)?,
            None => writeln!(f, "duration_sec=N/A")?,
        }
        writeln!(f, "bit_rate={}", self.format.bit_rate)?;
        writeln!(f, "nb_streams={}", self.format.nb_streams)?;
        writeln!(f, "[/FORMAT]")?;
        for s in &self.streams {
            writeln!(f, "[STREAM]")?;
            writeln!(f, "index={}", s.index)?;
            writeln!(f, "codec_type={}", s.codec_type)?;
            writeln!(f, "codec_name={}", s.codec_name)?;
            writeln!(f, "time_base={}", s.time_base)?;
            if let Some(d) = s.duration_ts {
                writeln!(f, "duration_ts={}", d)?;
            }
            if let Some(d) = s.duration_sec {
                writeln!(f, "duration_sec={:.3}", d)?;
            }
            writeln!(f, "rate={}", s.rate)?;
            if let (Some(w), Some(h)) = (s.width, s.height) {
                writeln!(f, "width={}", w)?;
                writeln!(f, "height={}", h)?;
            }
            if let Some(r) = s.rotation {
                writeln!(f, "rotation={:.1}", r)?;
            }
            if let Some(sr) = s.sample_rate {
                writeln!(f, "sample_rate={}", sr)?;
            }
            if let Some(c) = s.channels {
                writeln!(f, "channels={}", c)?;
            }
            writeln!(f, "[/STREAM]")?;
        }
        Ok(())
    }
}

fn stream_info(track: &AvTrack) -> StreamInfo {
    let params = track.parameters();
    let time_base = track.time_base();
    let rate = track.rate();
    let duration_sec = track
        .duration()
        .filter(|_| time_base.denominator() != 0)
        .map(|d| d as f64 * f64::from(time_base));

    let (width, height, rotation) = if track.is_video() {
        (
            Some(track.width()),
            Some(track.height()),
            Some(track.transform().degrees()),
        )
    } else {
        (None, None, None)
    };
    let (sample_rate, channels) = if track.is_audio() {
        (Some(track.sample_rate()), Some(track.channels()))
    } else {
        (None, None)
    };

    StreamInfo {
        index: track.index(),
        codec_type: format!("{:?}", track.medium()).to_lowercase(),
        codec_name: format!("{:?}", params.id()).to_lowercase(),
        time_base: format!("{}/{}", time_base.numerator(), time_base.denominator()),
        duration_ts: track.duration(),
        duration_sec,
        rate: format!("{}/{}", rate.numerator(), rate.denominator()),
        width,
        height,
        rotation,
        sample_rate,
        channels,
    }
}

/// Opens a file and returns media metadata (similar to ffprobe).
///
/// ```ignore
/// let info = ffmpeg_filter::probe("input.mp4")?;
/// println!("{}", info);
/// ```
pub fn probe(path: impl AsRef<Path>) -> anyhow::Result<MediaInfo> {
    let path = path.as_ref();
    let input = ffmpeg_next::format::input(path)
        .with_context(|| format!("probing {}", path.display()))?;

    let duration_sec = match input.duration() {
        d if d == ffmpeg_next::ffi::AV_NOPTS_VALUE as i64 || d <= 0 => None,
        d => Some(d as f64 / ffmpeg_next::ffi::AV_TIME_BASE as f64),
    };
    let streams = input
        .streams()
        .map(|stream| stream_info(&AvTrack::from(stream)))
        .collect();

    Ok(MediaInfo {
        format: FormatInfo {
            format_name: input.format().name().to_string(),
            duration_sec,
            bit_rate: input.bit_rate(),
            nb_streams: input.nb_streams(),
        },
        streams,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(width: u32, height: u32, rotation: Option<f64>) -> StreamInfo {
        StreamInfo {
            index: 0,
            codec_type: "video".into(),
            codec_name: "h264".into(),
            time_base: "1/15360".into(),
            duration_ts: None,
            duration_sec: None,
            rate: "30/1".into(),
            width: Some(width),
            height: Some(height),
            rotation,
            sample_rate: None,
            channels: None,
        }
    }

    #[test]
    fn test_display_size_follows_rotation() {
        assert_eq!(video(640, 480, None).display_size(), Some((640, 480)));
        assert_eq!(video(640, 480, Some(90.0)).display_size(), Some((480, 640)));
        assert_eq!(video(640, 480, Some(-90.0)).display_size(), Some((480, 640)));
        assert_eq!(video(640, 480, Some(180.0)).display_size(), Some((640, 480)));
    }

    #[test]
    fn test_probe_missing_file_fails() {
        assert!(probe("/definitely/not/here.mp4").is_err());
    }
}

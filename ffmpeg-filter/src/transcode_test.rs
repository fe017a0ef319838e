use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::*;
use crate::{
    geometry::RotationClass,
    metadata::probe,
    test_fixture::{FPS, Fixture, HEIGHT, SAMPLE_RATE, WIDTH, fixture},
};

fn options(output_dir: &Path) -> TranscodeOptions {
    TranscodeOptions {
        output_dir: output_dir.to_path_buf(),
        video_preset: Some("ultrafast".to_string()),
        ..Default::default()
    }
}

fn identity() -> ProcessingFunction {
    Arc::new(|image: FrameImage| Some(image))
}

/// Video track, audio track and container durations, in seconds.
fn durations(path: &Path) -> anyhow::Result<[f64; 3]> {
    let info = probe(path)?;
    let missing = |what: &str| anyhow::anyhow!("{} has no {} duration", path.display(), what);
    Ok([
        info.video().and_then(|s| s.duration_sec).ok_or_else(|| missing("video"))?,
        info.audio().and_then(|s| s.duration_sec).ok_or_else(|| missing("audio"))?,
        info.format.duration_sec.ok_or_else(|| missing("container"))?,
    ])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transcode_keeps_duration_and_audio() -> anyhow::Result<()> {
    let sources = tempfile::tempdir()?;
    let outputs = tempfile::tempdir()?;
    let source = fixture(sources.path(), "av", Fixture::default()).await?;

    let output = transcode(&source, identity(), options(outputs.path())).await?;

    assert!(output.starts_with(outputs.path()));
    assert_eq!(output.extension().and_then(|e| e.to_str()), Some("mp4"));
    let (expected, actual) = (durations(&source)?, durations(&output)?);
    for (what, (expected, actual)) in ["video", "audio", "container"]
        .into_iter()
        .zip(expected.into_iter().zip(actual))
    {
        assert!(
            (expected - actual).abs() <= 1.0 / FPS as f64 + 1e-3,
            "{}: source {:.3}s, output {:.3}s",
            what,
            expected,
            actual
        );
    }

    let info = probe(&output)?;
    let video = info.video().ok_or_else(|| anyhow::anyhow!("no video stream"))?;
    assert_eq!(video.codec_name, "h264");
    assert_eq!((video.width, video.height), (Some(WIDTH), Some(HEIGHT)));
    let audio = info.audio().ok_or_else(|| anyhow::anyhow!("no audio stream"))?;
    assert_eq!(audio.codec_name, "aac");
    assert_eq!(audio.sample_rate, Some(SAMPLE_RATE));
    assert_eq!(audio.channels, Some(2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transcode_without_audio_track() -> anyhow::Result<()> {
    let sources = tempfile::tempdir()?;
    let outputs = tempfile::tempdir()?;
    let source = fixture(
        sources.path(),
        "silent",
        Fixture {
            audio: false,
            ..Default::default()
        },
    )
    .await?;

    let frames = Arc::new(AtomicUsize::new(0));
    let counter = frames.clone();
    let processing: ProcessingFunction = Arc::new(move |image: FrameImage| {
        counter.fetch_add(1, Ordering::SeqCst);
        Some(image)
    });
    let output = transcode(&source, processing, options(outputs.path())).await?;

    let info = probe(&output)?;
    assert!(info.video().is_some());
    assert!(info.audio().is_none());
    assert_eq!(frames.load(Ordering::SeqCst), 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quarter_turn_is_baked_in() -> anyhow::Result<()> {
    let sources = tempfile::tempdir()?;
    let outputs = tempfile::tempdir()?;
    let source = fixture(
        sources.path(),
        "portrait",
        Fixture {
            rotation: 90.0,
            ..Default::default()
        },
    )
    .await?;
    let source_rotation = probe(&source)?.video().and_then(|s| s.rotation);
    assert_eq!(source_rotation.map(RotationClass::classify), Some(RotationClass::Quarter));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let processing: ProcessingFunction = Arc::new(move |image: FrameImage| {
        record.lock().push(image.dimensions());
        Some(image)
    });
    let output = transcode(&source, processing, options(outputs.path())).await?;

    assert!(!seen.lock().is_empty());
    assert!(seen.lock().iter().all(|dims| *dims == (HEIGHT, WIDTH)));
    let info = probe(&output)?;
    let video = info.video().ok_or_else(|| anyhow::anyhow!("no video stream"))?;
    assert_eq!((video.width, video.height), (Some(HEIGHT), Some(WIDTH)));
    assert_eq!(video.rotation.map(RotationClass::classify), Some(RotationClass::Identity));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_half_turn_stays_metadata() -> anyhow::Result<()> {
    let sources = tempfile::tempdir()?;
    let outputs = tempfile::tempdir()?;
    let source = fixture(
        sources.path(),
        "upside-down",
        Fixture {
            rotation: 180.0,
            audio: false,
            ..Default::default()
        },
    )
    .await?;

    let output = transcode(&source, identity(), options(outputs.path())).await?;

    let info = probe(&output)?;
    let video = info.video().ok_or_else(|| anyhow::anyhow!("no video stream"))?;
    assert_eq!((video.width, video.height), (Some(WIDTH), Some(HEIGHT)));
    assert_eq!(video.rotation.map(RotationClass::classify), Some(RotationClass::Half));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_image_fails_and_removes_output() -> anyhow::Result<()> {
    let sources = tempfile::tempdir()?;
    let outputs = tempfile::tempdir()?;
    let source = fixture(sources.path(), "failing", Fixture::default()).await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let processing: ProcessingFunction = Arc::new(move |image: FrameImage| {
        (counter.fetch_add(1, Ordering::SeqCst) < 2).then_some(image)
    });
    let err = transcode(&source, processing, options(outputs.path()))
        .await
        .unwrap_err();

    assert!(err.is_transform_failure(), "unexpected error: {}", err);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(std::fs::read_dir(outputs.path())?.count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successive_runs_get_distinct_outputs() -> anyhow::Result<()> {
    let sources = tempfile::tempdir()?;
    let outputs = tempfile::tempdir()?;
    let source = fixture(sources.path(), "twice", Fixture::default()).await?;

    let first = transcode(&source, identity(), options(outputs.path())).await?;
    let invert = |image: &FrameImage| {
        let mut inverted = image.clone();
        image::imageops::invert(&mut inverted);
        inverted
    };
    let second = filter_video(&source, invert, options(outputs.path())).await?;

    assert_ne!(first, second);
    for path in [&first, &second] {
        let info = probe(path)?;
        assert!(info.video().is_some(), "{} has no video", path.display());
        assert!(info.format.duration_sec.is_some());
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreadable_source_is_source_open() -> anyhow::Result<()> {
    crate::init()?;
    let outputs = tempfile::tempdir()?;
    let missing = outputs.path().join("missing.mp4");

    let err = transcode(&missing, identity(), options(outputs.path()))
        .await
        .unwrap_err();

    assert!(matches!(err, TranscodeError::SourceOpen { ref path, .. } if *path == missing));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unwritable_destination_is_output_create() -> anyhow::Result<()> {
    let sources = tempfile::tempdir()?;
    let outputs = tempfile::tempdir()?;
    let source = fixture(
        sources.path(),
        "nowhere",
        Fixture {
            frames: 2,
            audio: false,
            ..Default::default()
        },
    )
    .await?;

    let err = transcode(&source, identity(), options(&outputs.path().join("absent")))
        .await
        .unwrap_err();

    assert!(matches!(err, TranscodeError::OutputCreate { .. }), "unexpected error: {}", err);
    Ok(())
}

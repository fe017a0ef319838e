use clap::Parser;

mod config;
mod filters;

use config::{Cli, Command, RunArgs};
use filters::Filter;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_filter", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    ffmpeg_filter::init()?;

    let cli = Cli::parse();
    match cli.cmd {
        Command::Probe { path } => {
            let info = ffmpeg_filter::probe(&path)?;
            print!("{}", info);
            Ok(())
        }
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let options = args.output.options()?;
    let info = ffmpeg_filter::probe(&args.source)?;
    let Some(video) = info.video() else {
        anyhow::bail!("{} has no video stream", args.source.display());
    };
    let (width, height) = video.display_size().unwrap_or_default();
    log::info!(
        "{}: {} displayed at {}x{}, rotation {:?}, {} stream(s)",
        args.source.display(),
        video.codec_name,
        width,
        height,
        video.rotation,
        info.streams.len()
    );

    let filter = Filter::new(args.filter, args.brightness, args.sigma);
    log::info!("applying {:?}", args.filter);
    let output = ffmpeg_filter::filter_video(&args.source, move |image| filter.apply(image), options).await?;
    println!("{}", output.display());
    Ok(())
}

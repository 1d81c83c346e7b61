//! camfeedd - camera feed daemon
//!
//! This daemon:
//! 1. Loads configuration (file given by --config / CAMFEED_CONFIG, then env)
//! 2. Connects to the MQTT broker and listens on `<base>/camera_control`
//! 3. Opens the capture device or stream
//! 4. Publishes composed JPEG frames to `<base>/image_<W>x<H>` until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use camfeed::transport::MqttLink;
use camfeed::{
    build_source, ChannelTopics, FeedConfig, OutputSelector, Pipeline, PipelineController,
    PipelineSettings, PipelineState,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish a camera as letterboxed JPEG frames over MQTT")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "CAMFEED_CONFIG")]
    config: Option<PathBuf>,

    /// Allow non-loopback MQTT brokers.
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = FeedConfig::load_from(args.config.as_deref())?;
    if args.allow_remote_mqtt {
        cfg.mqtt.allow_remote = true;
    }
    log::info!(
        "camfeedd {}: {} capture from {} at {} fps, canvases {} / {}, tick {:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.capture.mode,
        cfg.capture.device_path,
        cfg.capture.fps,
        cfg.large,
        cfg.small,
        cfg.capture.tick_period()
    );

    let selector = Arc::new(OutputSelector::new(cfg.initial_output));
    let topics = ChannelTopics::new(&cfg.base_topic, &cfg.large, &cfg.small);
    log::info!(
        "publishing to {} / {}, control on {}",
        topics.large,
        topics.small,
        topics.control
    );
    let link = MqttLink::connect(&cfg.mqtt, topics, Arc::clone(&selector))?;

    let source = build_source(&cfg.capture)?;
    let pipeline = Pipeline::new(
        PipelineSettings::from_config(&cfg),
        source,
        Box::new(link.publisher(cfg.jpeg_quality)),
        selector,
    );
    let mut controller = PipelineController::with_interval(pipeline);

    // Installed before start so Ctrl-C also interrupts open retries.
    let (tx, rx) = mpsc::channel();
    let stop_signal = controller.stop_signal();
    ctrlc::set_handler(move || {
        stop_signal.trigger();
        let _ = tx.send(());
    })
    .context("set Ctrl-C handler")?;

    if controller.start()? == PipelineState::Idle {
        log::warn!("capture unavailable; no frames will be published");
    }

    log::info!("camfeedd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping pipeline...");

    let stopped = controller.stop();
    let stats = controller.stats();
    log::info!(
        "published {} large / {} small frames over {} ticks ({} skipped)",
        stats.published_large,
        stats.published_small,
        stats.ticks,
        stats.skipped
    );
    let disconnected = link.disconnect();
    stopped?;
    disconnected
}

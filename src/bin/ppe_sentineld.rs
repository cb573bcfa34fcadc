//! ppe_sentineld - PPE compliance daemon
//!
//! This daemon:
//! 1. Reads frames from an RTSP camera (or the synthetic generator)
//! 2. Runs PPE detection on every frame (accelerator or simulation)
//! 3. Publishes one alert per violation class per cooldown window
//! 4. Stores an annotated snapshot per alert when an evidence sink is configured
//! 5. Publishes a status snapshot periodically and once more on shutdown

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ppe_sentinel::{
    config::SentinelConfig,
    detect::{default_accelerator, ClassCatalog, DetectionEngine},
    evidence,
    ingest::create_source,
    notify::{LogNotifier, MqttNotifier, Notifier, Topics},
    pipeline::{Pipeline, PipelineSettings},
    ui::{format_duration, Ui, UiMode},
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML or JSON). Falls back to PPE_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Use the synthetic source and simulated detector.
    #[arg(long)]
    simulate: bool,
    /// Camera stream URL, overrides the config file.
    #[arg(long)]
    rtsp_url: Option<String>,
    /// Model file, overrides the config file.
    #[arg(long)]
    model_path: Option<PathBuf>,
    /// Startup output style.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::for_stderr(args.ui);

    let cfg = {
        let stage = ui.stage("Loading configuration");
        match load_config(&args) {
            Ok(cfg) => cfg,
            Err(e) => {
                stage.fail();
                return Err(e);
            }
        }
    };

    let source = {
        let stage = ui.stage("Preparing frame source");
        match create_source(&cfg.source) {
            Ok(source) => source,
            Err(e) => {
                stage.fail();
                return Err(e);
            }
        }
    };

    let engine = {
        let _stage = ui.stage("Loading detector");
        let accelerator = default_accelerator(cfg.detector.input_width, cfg.detector.input_height);
        DetectionEngine::new(cfg.detector.clone(), ClassCatalog::ppe(), accelerator)?
    };

    let notifier: Box<dyn Notifier> = match cfg.mqtt_settings() {
        Some(settings) => {
            let stage = ui.stage("Connecting to MQTT broker");
            match MqttNotifier::connect(&settings, &Topics::for_device(&cfg.device_id)) {
                Ok(notifier) => Box::new(notifier),
                Err(e) => {
                    stage.fail();
                    return Err(e);
                }
            }
        }
        None => {
            log::warn!("no MQTT broker configured; messages are written to the log only");
            Box::new(LogNotifier::new())
        }
    };

    let sink = evidence::create_sink(cfg.evidence.dir.as_deref(), cfg.evidence.http_url.as_deref())?;

    let engine_stats = engine.stats();
    ui.summary(
        "PPE Sentinel",
        &[
            ("device", cfg.device_id.clone()),
            ("source", source.name().to_string()),
            (
                "detector",
                format!("{:?}", engine_stats.mode).to_lowercase(),
            ),
            ("notifier", notifier.name().to_string()),
            (
                "evidence",
                sink.as_ref().map(|s| s.name()).unwrap_or("disabled").to_string(),
            ),
            ("cooldown", format_duration(cfg.alerts.cooldown)),
            ("status every", format_duration(cfg.alerts.status_interval)),
        ],
    );
    if let Some(reason) = &engine_stats.fallback_reason {
        log::warn!("detector fell back to simulation: {}", reason);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    log::info!("ppe_sentineld running. press Ctrl-C to stop");

    let mut pipeline = Pipeline::new(
        PipelineSettings::from_config(&cfg),
        source,
        engine,
        notifier,
        sink,
    );
    let summary = pipeline.run(&stop);

    ui.summary(
        "Session Summary",
        &[
            ("frames processed", summary.frames_processed.to_string()),
            ("detections", summary.detections_total.to_string()),
            ("violations", summary.violations_total.to_string()),
            ("alerts published", summary.alerts_published.to_string()),
            ("uptime", format_duration(summary.uptime)),
        ],
    );
    Ok(())
}

fn load_config(args: &Args) -> Result<SentinelConfig> {
    let mut cfg = match &args.config {
        Some(path) => SentinelConfig::load_from(Some(path.as_path()))?,
        None => SentinelConfig::load()?,
    };
    if let Some(url) = &args.rtsp_url {
        cfg.source.url = Some(url.clone());
        cfg.set_simulation(false);
    }
    if let Some(path) = &args.model_path {
        cfg.detector.model_path = Some(path.clone());
    }
    if args.simulate {
        cfg.set_simulation(true);
    }
    cfg.validate()?;
    Ok(cfg)
}

use anyhow::{Context, Result};
use backend::{MemoryArraySource, SeriesRegistry};
use clap::{Parser, Subcommand};
use frontend::{PanDirection, SeriesView, VisibleLoad, VisibleWindow, ZoomDirection};
use shared::{Attributes, EngineConfig, NumericArray, TimeRange, load_config};
use std::f64::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const ELECTRICAL_SERIES: &str = "/acquisition/ElectricalSeries";
const POSITION_SERIES: &str = "/processing/behavior/Position";

#[derive(Parser)]
#[command(name = "novyscope")]
#[command(about = "Navigate large remote time series without downloading them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a synthetic recording through open, load, zoom and pan
    Demo {
        /// Engine configuration (TOML); defaults are used when omitted
        #[arg(long, short)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "60")]
        seconds: f64,

        #[arg(long, default_value = "1000")]
        rate: f64,

        #[arg(long, default_value = "4")]
        channels: u64,

        /// Simulated round trip of every data request, in milliseconds
        #[arg(long, default_value = "20")]
        latency: u64,
    },
    /// Print the effective configuration as TOML
    Config {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Demo {
            config,
            seconds,
            rate,
            channels,
            latency,
        } => {
            let recording = Recording {
                seconds,
                rate,
                channels,
                latency: Duration::from_millis(latency),
            };
            match resolve_config(config) {
                Ok(config) => run_demo(config, recording).await,
                Err(e) => Err(e),
            }
        }
        Commands::Config { config } => resolve_config(config)
            .and_then(|config| config.to_toml_string())
            .map(|text| print!("{}", text)),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn resolve_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => load_config(&path),
        None => Ok(EngineConfig::default()),
    }
}

// ===== DEMO =====

struct Recording {
    seconds: f64,
    rate: f64,
    channels: u64,
    latency: Duration,
}

impl Recording {
    fn sample_count(&self) -> u64 {
        (self.seconds * self.rate).round().max(1.0) as u64
    }

    /// A regular multi-channel series and an irregularly sampled one, stored the way
    /// a remote neurophysiology file lays them out.
    fn build(&self) -> Arc<MemoryArraySource> {
        let source = MemoryArraySource::new();
        let samples = self.sample_count();
        let channels = self.channels.max(1);

        let mut starting_time = Attributes::new();
        starting_time.insert("rate".to_string(), serde_json::json!(self.rate));
        source.insert_dataset(
            &format!("{}/starting_time", ELECTRICAL_SERIES),
            vec![],
            NumericArray::F64(vec![0.0]),
            starting_time,
        );

        let rate = self.rate;
        let values: Vec<i16> = (0..samples)
            .flat_map(|sample| {
                (0..channels).map(move |channel| {
                    let time = sample as f64 / rate;
                    let wave = (TAU * (channel + 1) as f64 * time).sin() * 800.0;
                    let jitter = ((sample * 7_919 + channel * 104_729) % 200) as f64 - 100.0;
                    (wave + jitter) as i16
                })
            })
            .collect();
        let mut data_attrs = Attributes::new();
        data_attrs.insert("conversion".to_string(), serde_json::json!(0.195e-6));
        data_attrs.insert("unit".to_string(), serde_json::json!("volts"));
        source.insert_dataset(
            &format!("{}/data", ELECTRICAL_SERIES),
            vec![samples, channels],
            NumericArray::I16(values),
            data_attrs,
        );

        // ~30 Hz tracking with uneven frame spacing and a trailing invalid frame
        let frames = (self.seconds * 30.0) as u64;
        let mut timestamps: Vec<f64> = (0..frames)
            .map(|frame| frame as f64 / 30.0 + ((frame * 37) % 11) as f64 * 1e-3)
            .collect();
        timestamps.push(f64::NAN);
        let positions: Vec<f64> = (0..timestamps.len())
            .flat_map(|frame| {
                let angle = frame as f64 / 90.0;
                [angle.cos(), angle.sin()]
            })
            .collect();
        source.insert_dataset(
            &format!("{}/timestamps", POSITION_SERIES),
            vec![timestamps.len() as u64],
            NumericArray::F64(timestamps.clone()),
            Attributes::new(),
        );
        source.insert_dataset(
            &format!("{}/data", POSITION_SERIES),
            vec![timestamps.len() as u64, 2],
            NumericArray::F64(positions),
            Attributes::new(),
        );

        let latency = self.latency;
        for path in [
            format!("{}/data", ELECTRICAL_SERIES),
            format!("{}/data", POSITION_SERIES),
            format!("{}/timestamps", POSITION_SERIES),
        ] {
            source.set_latency(&path, move |_| latency);
        }
        source
    }
}

async fn run_demo(config: EngineConfig, recording: Recording) -> Result<()> {
    log::info!(
        "Synthetic recording: {} channels, {} samples at {} Hz",
        recording.channels,
        recording.sample_count(),
        recording.rate
    );
    let registry = SeriesRegistry::new(recording.build(), config);

    for object_path in [ELECTRICAL_SERIES, POSITION_SERIES] {
        let handle = registry
            .open_series(object_path)
            .await
            .with_context(|| format!("Failed to open {}", object_path))?;
        let view = SeriesView::open(&handle, handle.chunking_options())
            .with_context(|| format!("Failed to create a view of {}", object_path))?;
        log::info!(
            "{}: {} timestamps, {} channel(s), loads at most {:.3}s at once",
            object_path,
            if view.resolver().is_regular() { "regular" } else { "irregular" },
            view.client().channel_count(),
            view.max_visible_duration()
        );

        report(object_path, "initial window", &view).await?;

        let center = view
            .controller()
            .state()
            .visible_range()
            .map(TimeRange::center);
        for _ in 0..6 {
            view.controller().zoom(ZoomDirection::In, center);
        }
        report(object_path, "zoomed in", &view).await?;

        for _ in 0..3 {
            view.controller().pan(PanDirection::Forward);
        }
        report(object_path, "panned forward", &view).await?;

        view.controller().zoom(ZoomDirection::Out, None);
        report(object_path, "zoomed out", &view).await?;

        view.close();
        registry.close_series(handle.id());
    }

    registry.close();
    Ok(())
}

/// Loads the visible window, repeating partial loads until every chunk is in.
async fn report(object_path: &str, step: &str, view: &SeriesView) -> Result<()> {
    let range = view.controller().state().visible_range();
    let window = loop {
        let load = view
            .load_visible()
            .await
            .with_context(|| format!("Failed to load {} ({})", object_path, step))?;
        let window = match load {
            VisibleLoad::Loaded(window) => window,
            VisibleLoad::Empty => {
                log::warn!("{}: nothing visible", object_path);
                return Ok(());
            }
            VisibleLoad::ZoomInRequired {
                duration,
                max_duration,
            } => {
                log::warn!(
                    "{} [{}]: {:.3}s visible, zoom in below {:.3}s to load",
                    object_path,
                    step,
                    duration,
                    max_duration
                );
                return Ok(());
            }
        };
        if window.completed {
            break window;
        }
        log::info!("{}: partial window, loading the rest", object_path);
    };

    log::info!(
        "{} [{}] {}: samples [{}, {}), {}",
        object_path,
        step,
        range.map_or_else(|| "-".to_string(), |range| range.to_string()),
        window.start_index,
        window.end_index,
        summarize(&window)
    );
    Ok(())
}

fn summarize(window: &VisibleWindow) -> String {
    window
        .channels
        .iter()
        .enumerate()
        .map(|(channel, row)| {
            let (min, max) = row
                .iter()
                .filter(|value| value.is_finite())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
                    (min.min(*value), max.max(*value))
                });
            format!("ch{} {:.3e}..{:.3e}", channel, min, max)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

use amg_vision::{
    build_sam2, load_rgb, probe_for, AutomaticMaskGenerator, BenchmarkConfig, BenchmarkRunner,
    HarnessConfig, Precision, TraceRecorder, Visualizer,
};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "amg-bench")]
#[command(about = "SAM2 automatic mask generation benchmark")]
struct Cli {
    /// Harness configuration file (JSON, TOML or YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Image to segment
    #[arg(long)]
    image: Option<PathBuf>,

    /// Directory holding the model graphs
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Model descriptor file or built-in variant
    #[arg(long)]
    model_config: Option<String>,

    /// Device: cpu, cuda or cuda:N
    #[arg(long)]
    device: Option<String>,

    /// Precision: f32, f16, bf16 or native
    #[arg(long)]
    precision: Option<String>,

    /// Warmup iterations
    #[arg(long)]
    warmup: Option<usize>,

    /// Timed iterations
    #[arg(long)]
    iterations: Option<usize>,

    /// Overlay PNG destination
    #[arg(long)]
    overlay: Option<PathBuf>,

    /// Trace destination (.json or .json.gz)
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Seed for overlay colours
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_precision(value: &str) -> anyhow::Result<Option<Precision>> {
    if value.eq_ignore_ascii_case("native") {
        return Ok(None);
    }
    let precision = value
        .parse::<Precision>()
        .map_err(|e| anyhow::anyhow!("Invalid --precision '{}': {}", value, e))?;
    Ok(Some(precision))
}

/// File configuration (or defaults) with command-line overrides applied
fn harness_config(cli: &Cli) -> anyhow::Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => HarnessConfig::default(),
    };

    if let Some(image) = &cli.image {
        config.image_path = image.clone();
    }
    if let Some(checkpoint) = &cli.checkpoint {
        config.checkpoint = checkpoint.clone();
    }
    if let Some(model_config) = &cli.model_config {
        config.model_config = model_config.clone();
    }
    if let Some(device) = &cli.device {
        config.device = device.clone();
    }
    if let Some(precision) = &cli.precision {
        config.precision = parse_precision(precision)?;
    }
    if let Some(warmup) = cli.warmup {
        config.warmup_iterations = warmup;
    }
    if let Some(iterations) = cli.iterations {
        config.iterations = iterations;
    }
    if let Some(overlay) = &cli.overlay {
        config.overlay_path = overlay.clone();
    }
    if let Some(trace) = &cli.trace {
        config.trace_path = trace.clone();
    }
    if cli.seed.is_some() {
        config.color_seed = cli.seed;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let recorder = TraceRecorder::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .with(recorder.clone().with_filter(recorder.active_filter()))
        .init();

    let config = harness_config(&cli)?;
    info!("Benchmarking {} on {}", config.model_config, config.device);

    let image = load_rgb(&config.image_path)
        .with_context(|| format!("Failed to load image {:?}", config.image_path))?;

    let model = build_sam2(&config.model_config, &config.checkpoint, &config.device)?
        .apply_eval_precision(config.precision)?;
    let probe = probe_for(model.device())?;
    let generator = AutomaticMaskGenerator::new(model, config.generator.clone())?;
    let runner = BenchmarkRunner::new(BenchmarkConfig::from(&config))?.with_probe(probe);

    let masks = runner.warmup(&generator, &image)?;

    let mut visualizer = Visualizer::with_seed(config.color_seed);
    visualizer.show_annotations(&image, &masks, &config.overlay_path)?;

    let latency = runner.time(&generator, &image)?;
    println!("{}", latency);

    runner.profile(&generator, &image, &recorder, &config.trace_path)?;

    if let Some(report) = runner.memory_report() {
        println!("{}", report?);
    }

    Ok(())
}

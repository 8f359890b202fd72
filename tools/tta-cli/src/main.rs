use clap::{ArgAction, Parser, ValueEnum, ValueHint};
use serde::Serialize;
use spiral_config::determinism::{self, DeterminismConfig};
use spiral_config::tracing::{flush_chrome_trace, init_tracing_with, TracingOptions};
use st_nn::io::{load_module, save_module};
use st_tta::bench::{
    BenchmarkConfig, Corruption, CorruptionKind, PrototypeClassifier, ShiftedBenchmark,
};
use st_tta::runner::{evaluate, run, RunReport, RunnerConfig};
use st_tta::{
    setup_adapter, AdaptConfig, AdaptationMode, Objective, OptimizerKind, ParameterScope,
    UnsupervisedObjective,
};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

type DynError = Box<dyn Error>;

type Result<T> = std::result::Result<T, DynError>;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ObjectiveArg {
    /// Batch nuclear-norm maximisation
    Bnm,
    /// Mean softmax entropy
    Entropy,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OptimizerArg {
    Adam,
    Sgd,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScopeArg {
    /// Normalization scale and shift only
    Affine,
    /// Every parameter (frozen ones never move)
    All,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CorruptionArg {
    Original,
    GaussianNoise,
    Shift,
    Contrast,
}

impl From<CorruptionArg> for CorruptionKind {
    fn from(value: CorruptionArg) -> Self {
        match value {
            CorruptionArg::Original => CorruptionKind::Original,
            CorruptionArg::GaussianNoise => CorruptionKind::GaussianNoise,
            CorruptionArg::Shift => CorruptionKind::Shift,
            CorruptionArg::Contrast => CorruptionKind::Contrast,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Test-time adaptation of normalization layers on a shifted benchmark"
)]
struct Cli {
    /// Optional JSON file with adaptation settings; explicit flags override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Learning rate of the adaptation optimiser
    #[arg(long)]
    lr: Option<f32>,

    /// Adaptation steps per batch
    #[arg(long)]
    steps: Option<usize>,

    /// Restore the initial state before every batch
    #[arg(long, action = ArgAction::SetTrue)]
    episodic: bool,

    /// Unsupervised objective to minimise
    #[arg(long, value_enum)]
    objective: Option<ObjectiveArg>,

    /// Gradient optimiser
    #[arg(long, value_enum)]
    optimizer: Option<OptimizerArg>,

    /// Parameters handed to the optimiser
    #[arg(long, value_enum)]
    scope: Option<ScopeArg>,

    /// Seed for the benchmark and every derived RNG
    #[arg(long)]
    seed: Option<u64>,

    /// Maximum number of adaptation epochs
    #[arg(long, default_value_t = 20)]
    nepoch: usize,

    /// Early-stop window in epochs (0 disables it)
    #[arg(long, default_value_t = 5)]
    stopepoch: usize,

    /// Corruption applied to the test stream
    #[arg(long, value_enum, default_value_t = CorruptionArg::Shift)]
    corruption: CorruptionArg,

    /// Corruption severity (1-5)
    #[arg(long, default_value_t = 5)]
    level: u8,

    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// Number of test samples streamed through the adapter per epoch
    #[arg(long, default_value_t = 1_000_000)]
    num_sample: usize,

    /// Number of classes in the synthetic task
    #[arg(long, default_value_t = 10)]
    classes: usize,

    /// Input feature count of the synthetic task
    #[arg(long, default_value_t = 16)]
    features: usize,

    /// Clean samples per class used to fit the pretrained classifier
    #[arg(long, default_value_t = 200)]
    train_per_class: usize,

    /// Test samples per class
    #[arg(long, default_value_t = 100)]
    test_per_class: usize,

    /// Pretrained checkpoint; loaded when present, written after fitting otherwise
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: Option<PathBuf>,

    /// Destination for a JSON summary of the run
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "warn,st_tta=info")]
    log: String,
}

#[derive(Debug, Serialize)]
struct EpochSummary {
    epoch: usize,
    error: f32,
    loss: Option<f32>,
    elapsed_secs: f64,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    corruption: &'static str,
    level: u8,
    source_error: f32,
    initial_error: f32,
    final_error: f32,
    epochs: Vec<EpochSummary>,
    terminated_at: Option<usize>,
    best_epoch: Option<usize>,
    adapt: AdaptConfig,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        flush_chrome_trace();
        std::process::exit(1);
    }
    flush_chrome_trace();
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing_with(TracingOptions::default().with_default_filter(cli.log.clone()))?;
    if let Some(seed) = cli.seed {
        determinism::configure(DeterminismConfig::seeded(seed));
    }

    let adapt = adapt_config(&cli)?;
    let corruption = match CorruptionKind::from(cli.corruption) {
        CorruptionKind::Original => Corruption::clean(),
        kind => Corruption::new(kind, cli.level)?,
    };

    let mut bench = ShiftedBenchmark::new(BenchmarkConfig {
        classes: cli.classes,
        features: cli.features,
        seed: cli.seed,
        ..BenchmarkConfig::default()
    })?;
    let train = bench.sample(cli.train_per_class, Corruption::clean())?;
    let mut model = PrototypeClassifier::fit(&train, cli.classes)?.build()?;
    if let Some(path) = cli.checkpoint.as_deref() {
        sync_checkpoint(&mut model, path)?;
    }

    let test = bench.sample(cli.test_per_class, corruption)?;
    let adapt_split = test.subset(cli.num_sample)?;
    let batch_size = cli.batch_size.min(adapt_split.len()).max(1);
    let source_error = evaluate(&mut model, &test, batch_size)?;

    let mut adapter = setup_adapter(model, &adapt)?;
    let runner = RunnerConfig {
        epochs: cli.nepoch,
        stop_window: cli.stopepoch,
        batch_size,
    };

    println!("Test-time adaptation: {}", adapter.objective().name());
    println!("Error (%)\t\ttest");
    println!("{}{:.2}", pad("Source:"), source_error * 100.0);
    let report = run(&mut adapter, &adapt_split, &test, &runner)?;
    print_table(&report, cli.nepoch);

    if let Some(path) = cli.report.as_deref() {
        let summary = summarise(&report, corruption, source_error, adapt);
        write_summary(&summary, path)?;
    }
    Ok(())
}

fn adapt_config(cli: &Cli) -> Result<AdaptConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => AdaptConfig::default(),
    };
    if let Some(lr) = cli.lr {
        config.learning_rate = lr;
    }
    if let Some(steps) = cli.steps {
        config.steps = steps;
    }
    if cli.episodic {
        config.mode = AdaptationMode::Episodic;
    }
    if let Some(objective) = cli.objective {
        config.objective = match objective {
            ObjectiveArg::Bnm => Objective::BatchNuclearNorm,
            ObjectiveArg::Entropy => Objective::SoftmaxEntropy,
        };
    }
    if let Some(optimizer) = cli.optimizer {
        config.optimizer = match optimizer {
            OptimizerArg::Adam => OptimizerKind::Adam,
            OptimizerArg::Sgd => OptimizerKind::Sgd,
        };
    }
    if let Some(scope) = cli.scope {
        config.scope = match scope {
            ScopeArg::Affine => ParameterScope::NormalizationAffine,
            ScopeArg::All => ParameterScope::All,
        };
    }
    Ok(config)
}

fn sync_checkpoint(model: &mut st_nn::Sequential, path: &Path) -> Result<()> {
    if path.exists() {
        load_module(model, path)?;
        tracing::info!(path = %path.display(), "loaded pretrained checkpoint");
    } else {
        save_module(model, path)?;
        tracing::info!(path = %path.display(), "saved pretrained checkpoint");
    }
    Ok(())
}

fn pad(label: &str) -> String {
    format!("{label:<24}")
}

fn print_table(report: &RunReport, epochs: usize) {
    println!(
        "{}{:.2}",
        pad(&format!("Epoch 0/{epochs}:")),
        report.initial_error * 100.0
    );
    for epoch in &report.epochs {
        let loss = epoch
            .loss
            .map(|loss| format!("{loss:.4}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}{:.2}\t\t{loss}",
            pad(&format!(
                "Epoch {}/{} ({:.0}s):",
                epoch.epoch,
                epochs,
                epoch.elapsed.as_secs_f64()
            )),
            epoch.error * 100.0
        );
    }
    if let Some(stop) = report.early_stop {
        println!("Termination: {:.2}", stop.error * 100.0);
    }
}

fn summarise(
    report: &RunReport,
    corruption: Corruption,
    source_error: f32,
    adapt: AdaptConfig,
) -> RunSummary {
    RunSummary {
        corruption: corruption.kind.as_str(),
        level: corruption.level,
        source_error,
        initial_error: report.initial_error,
        final_error: report.final_error(),
        epochs: report
            .epochs
            .iter()
            .map(|epoch| EpochSummary {
                epoch: epoch.epoch,
                error: epoch.error,
                loss: epoch.loss,
                elapsed_secs: epoch.elapsed.as_secs_f64(),
            })
            .collect(),
        terminated_at: report.early_stop.map(|stop| stop.at_epoch),
        best_epoch: report.early_stop.map(|stop| stop.best_epoch),
        adapt,
    }
}

fn write_summary(summary: &RunSummary, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}

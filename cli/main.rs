#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use gxesim::config::{FitFailurePolicy, LambdaSelection, StudyConfig};
use gxesim::progress::{TrialProgressObserver, TrialStage};
use gxesim::report::run_full_study;

#[derive(Clone, Copy, ValueEnum)]
pub enum LambdaSelectionCli {
    /// Lambda with the smallest cross-validated deviance
    Min,
    /// Largest lambda within one standard error of the minimum
    OneSe,
}

impl From<LambdaSelectionCli> for LambdaSelection {
    fn from(value: LambdaSelectionCli) -> Self {
        match value {
            LambdaSelectionCli::Min => LambdaSelection::Min,
            LambdaSelectionCli::OneSe => LambdaSelection::OneSe,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// TOML study configuration; flags below override its values
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of individuals in the cohort (n)
    #[arg(long, value_name = "N")]
    pub n_individuals: Option<usize>,

    /// Number of SNPs (m)
    #[arg(long, value_name = "M")]
    pub n_snps: Option<usize>,

    /// Number of coefficient realizations (N)
    #[arg(long, value_name = "N")]
    pub realizations: Option<usize>,

    /// Probability that an individual is exposed
    #[arg(long)]
    pub exposure_prevalence: Option<f64>,

    /// Fraction of SNPs with a marginal effect
    #[arg(long)]
    pub snp_prevalence: Option<f64>,

    /// Fraction of active SNPs that also interact with the exposure
    #[arg(long)]
    pub interaction_prevalence: Option<f64>,

    /// Significance threshold for the likelihood-ratio test
    #[arg(long)]
    pub alpha: Option<f64>,

    /// Seed of the random generator
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of cross-validation folds for the lasso
    #[arg(long)]
    pub folds: Option<usize>,

    /// Rule for choosing the lasso penalty from the cross-validation curve
    #[arg(long, value_enum)]
    pub lambda_selection: Option<LambdaSelectionCli>,

    /// Skip and count failed fits instead of aborting the study
    #[arg(long)]
    pub skip_failed_fits: bool,

    /// Write the metrics as a TSV file
    #[arg(long, value_name = "PATH")]
    pub out: Option<PathBuf>,
}

impl RunArgs {
    fn resolve_config(&self) -> Result<StudyConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => StudyConfig::load(&path.to_string_lossy())?,
            None => StudyConfig::default(),
        };
        if let Some(n) = self.n_individuals {
            config.n_individuals = n;
        }
        if let Some(m) = self.n_snps {
            config.n_snps = m;
        }
        if let Some(n) = self.realizations {
            config.n_realizations = n;
        }
        if let Some(p) = self.exposure_prevalence {
            config.exposure_prevalence = p;
        }
        if let Some(p) = self.snp_prevalence {
            config.snp_prevalence = p;
        }
        if let Some(p) = self.interaction_prevalence {
            config.interaction_prevalence = p;
        }
        if let Some(alpha) = self.alpha {
            config.alpha = alpha;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(folds) = self.folds {
            config.lasso.n_folds = folds;
        }
        if let Some(selection) = self.lambda_selection {
            config.lasso.selection = selection.into();
        }
        if self.skip_failed_fits {
            config.fit_failure_policy = FitFailurePolicy::SkipAndCount;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Parser)]
#[command(
    name = "gxesim",
    about = "Simulation study of gene-environment interaction detection",
    long_about = "Generates synthetic case/control cohorts with known SNP x exposure \
                 interactions and measures how well per-SNP likelihood-ratio tests and a \
                 cross-validated lasso recover them."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full study and print the metrics table
    #[command(about = "Run the simulation study (optional output: metrics.tsv)")]
    Run(RunArgs),

    /// Write the default configuration as TOML
    #[command(about = "Write a default study configuration (outputs: study.toml)")]
    Config {
        /// Destination of the TOML file
        #[arg(long, value_name = "PATH", default_value = "study.toml")]
        out: PathBuf,
    },

    /// Display version information
    Version,
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}

/// Drives a terminal progress bar over the realization loop.
#[derive(Default)]
struct ConsoleProgress {
    bar: Option<ProgressBar>,
}

impl TrialProgressObserver for ConsoleProgress {
    fn on_stage_start(&mut self, stage: TrialStage, total_units: usize) {
        if stage == TrialStage::Realizations {
            self.bar = Some(create_progress_bar(total_units as u64, stage.describe()));
        }
    }

    fn on_stage_advance(&mut self, stage: TrialStage, completed_units: usize) {
        if let (TrialStage::Realizations, Some(bar)) = (stage, &self.bar) {
            bar.set_position(completed_units as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: TrialStage) {
        if stage == TrialStage::Realizations {
            if let Some(bar) = self.bar.take() {
                bar.finish_and_clear();
            }
        }
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.resolve_config()?;
    log::info!(
        "Study: n={}, m={}, N={}, exposure prevalence={}, SNP prevalence={}, interaction prevalence={}, seed={}",
        config.n_individuals,
        config.n_snps,
        config.n_realizations,
        config.exposure_prevalence,
        config.snp_prevalence,
        config.interaction_prevalence,
        config.seed
    );

    let mut progress = ConsoleProgress::default();
    let output = run_full_study(&config, &mut progress)?;
    println!("{}", output.table);

    if let Some(path) = args.out {
        output.report.write_tsv(&path)?;
        log::info!("Metrics written to {}", path.display());
    }
    Ok(())
}

fn write_default_config(out: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    StudyConfig::default().save(&out.to_string_lossy())?;
    println!("Default configuration written to {}", out.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Config { out }) => write_default_config(out),
        Some(Commands::Version) => {
            println!("gxesim {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

//! lockstep CLI - regression-test orchestrator.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lockstep::defs::{DefKind, DefStore, DefValue};
use lockstep::suite::{BaselineMode, Coordinator};
use lockstep::workdir::Workdir;

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(about = "Regression-test orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Test application directory (containing builds/, runs/, suites/)
    #[arg(short, long, default_value = ".")]
    app: PathBuf,

    /// Output directory for builds, runs, and logs
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a single run
    Run {
        /// Run definition name
        name: String,

        /// Record this run's output as a baseline under the given directory
        #[arg(long, conflicts_with = "use_baseline")]
        gen_baseline: Option<PathBuf>,

        /// Compare this run's output against baselines under the given directory
        #[arg(long)]
        use_baseline: Option<PathBuf>,
    },

    /// Execute a test suite
    Suite {
        /// Suite definition name
        name: String,
    },

    /// Execute a suite and record its output as baselines
    GenBaseline {
        /// Directory to create baselines under
        dir: PathBuf,

        /// Suite definition name
        suite: String,
    },

    /// Execute a suite, comparing output against stored baselines
    UseBaseline {
        /// Directory holding existing baselines
        dir: PathBuf,

        /// Suite definition name
        suite: String,
    },

    /// Remove everything previous invocations created in the output directory
    Clean,

    /// Display a definition's ancestry and fully merged content
    Show {
        /// Definition kind
        kind: ShowKind,

        /// Definition name
        name: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ShowKind {
    Build,
    Run,
    Suite,
}

impl From<ShowKind> for DefKind {
    fn from(kind: ShowKind) -> Self {
        match kind {
            ShowKind::Build => DefKind::Build,
            ShowKind::Run => DefKind::Run,
            ShowKind::Suite => DefKind::Suite,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let code = match cli.command {
        Commands::Run {
            ref name,
            ref gen_baseline,
            ref use_baseline,
        } => {
            let mode = match (gen_baseline, use_baseline) {
                (Some(dir), _) => BaselineMode::Generate(dir.clone()),
                (_, Some(dir)) => BaselineMode::Use(dir.clone()),
                _ => BaselineMode::Off,
            };
            let coord = coordinator(&cli, mode)?;
            match coord.run_single(name, BTreeMap::new()).await {
                Ok(report) => report.exit_code(),
                // already reported through the logbook
                Err(_) => 1,
            }
        }
        Commands::Suite { ref name } => run_suite(&cli, name, BaselineMode::Off).await?,
        Commands::GenBaseline { ref dir, ref suite } => {
            run_suite(&cli, suite, BaselineMode::Generate(dir.clone())).await?
        }
        Commands::UseBaseline { ref dir, ref suite } => {
            run_suite(&cli, suite, BaselineMode::Use(dir.clone())).await?
        }
        Commands::Clean => {
            clean(&cli)?;
            0
        }
        Commands::Show { kind, ref name } => {
            show(&cli, kind.into(), name)?;
            0
        }
    };
    std::process::exit(code);
}

fn coordinator(cli: &Cli, mode: BaselineMode) -> Result<Coordinator> {
    Coordinator::new(&cli.app, &cli.out, mode).with_context(|| {
        format!(
            "Failed to initialize output directory {}",
            cli.out.display()
        )
    })
}

async fn run_suite(cli: &Cli, name: &str, mode: BaselineMode) -> Result<i32> {
    let coord = coordinator(cli, mode)?;
    Ok(match coord.run_suite(name).await {
        Ok(report) => report.exit_code(),
        // already reported through the logbook
        Err(_) => 1,
    })
}

fn clean(cli: &Cli) -> Result<()> {
    let deleted = Workdir::new(&cli.out, "clean")
        .clean()
        .with_context(|| format!("Failed to clean {}", cli.out.display()))?;
    for item in deleted {
        info!("Deleted '{item}'");
    }
    Ok(())
}

fn show(cli: &Cli, kind: DefKind, name: &str) -> Result<()> {
    let store = DefStore::new(&cli.app);
    let chain = store.ancestry(kind, name)?;
    let merged = store.resolve(kind, name)?;
    println!("# {}", chain.join(" < "));
    print!("{}", DefValue::Map(merged).pretty(0));
    Ok(())
}

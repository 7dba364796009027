use chapter_pipeline::config::{self, PipelineConfig};
use chapter_pipeline::invoke::CommandInvoker;
use chapter_pipeline::output;
use chapter_pipeline::pipeline::{self, Pipeline, PipelineError, RunRequest, UnlockOutcome};
use chapter_pipeline::scheduler::{CancelToken, Strategy};
use chapter_pipeline::source::DirectorySource;
use chapter_pipeline::state::Phase;
use chapter_pipeline::store::StateStore;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit status for fatal errors: lock contention, corrupt state, I/O.
const EXIT_FATAL: u8 = 1;

fn version_string() -> &'static str {
    let on_tag = env!("PIPELINE_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("PIPELINE_GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once; only called while building the CLI
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "chapter-pipeline")]
#[command(about = "Resumable, checkpointed processing of book chapters")]
#[command(long_about = "\
Resumable, checkpointed processing of book chapters

Drives every chapter of a book through an external command (one per phase),
saving progress after every step. Interrupt it at any point and run the same
command again: completed chapters are skipped, interrupted ones start over.

Layout:

  chapters/                        # --chapters: one file per chapter
  ├── 001-arrival.md               # NNN- prefix sets document order
  ├── 002-the-road.md
  └── 010-part-two/
      └── 001-winter.txt

  runs/                            # --runs-dir
  ├── config.toml                  # optional, see 'gen-config'
  └── <run-id>/
      ├── state.json               # per-chapter status and results
      ├── progress.log             # append-only audit trail
      └── run.lock                 # present while a run is active

Exit status: 0 all chapters completed, 2 some chapters failed or the run was
interrupted, 1 fatal error (another run active, corrupt state, I/O failure).

Run 'chapter-pipeline gen-config' to generate a documented config.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Directory holding run state and config.toml
    #[arg(long, default_value = "runs", global = true)]
    runs_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start or resume a run
    Run(RunArgs),
    /// Show the persisted progress of a run
    Status {
        run_id: String,
        /// Progress log lines to show
        #[arg(long, default_value_t = 10)]
        log_lines: usize,
    },
    /// Remove a run's lock left behind by a crashed process
    Unlock {
        run_id: String,
        /// Remove the lock even if its owner looks alive
        #[arg(long)]
        force: bool,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Identifier of the run; reuse it to resume
    run_id: String,

    /// Directory of chapter files
    #[arg(long, default_value = "chapters")]
    chapters: PathBuf,

    /// analyze or illustrate
    #[arg(long, default_value = "analyze")]
    phase: Phase,

    /// Override scheduler.strategy
    #[arg(long)]
    strategy: Option<Strategy>,

    /// Override scheduler.concurrency
    #[arg(long)]
    concurrency: Option<usize>,

    /// Override retry.max_attempts
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Give Failed chapters a fresh retry budget
    #[arg(long)]
    retry_failed: bool,
}

impl RunArgs {
    /// Apply command-line overrides on top of the file config.
    fn apply(&self, config: &mut PipelineConfig) -> Result<(), config::ConfigError> {
        if let Some(strategy) = self.strategy {
            config.scheduler.strategy = strategy;
        }
        if let Some(n) = self.concurrency {
            config.scheduler.concurrency = n;
        }
        if let Some(n) = self.max_attempts {
            config.retry.max_attempts = n;
        }
        config.validate()
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn execute(cli: Cli) -> Result<ExitCode, PipelineError> {
    match cli.command {
        Command::Run(args) => {
            let mut config = config::load_config(&cli.runs_dir)?;
            args.apply(&mut config)?;

            let cancel = CancelToken::new();
            register_signals(&cancel)?;

            let invoker = CommandInvoker::new(config.invoker.clone());
            let source = DirectorySource::new(&args.chapters);
            let request = RunRequest {
                run_id: args.run_id.clone(),
                phase: args.phase,
                retry_failed: args.retry_failed,
            };

            let (tx, rx) = std::sync::mpsc::channel();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    for line in output::format_progress_event(&event) {
                        println!("{}", line);
                    }
                }
            });
            let result = Pipeline::new(StateStore::new(&cli.runs_dir), config, &invoker)
                .with_cancel_token(cancel)
                .with_progress(tx)
                .run(&request, &source);
            // The pipeline (and its sender) is gone, so the printer drains and exits
            printer.join().ok();

            let report = result?;
            println!();
            output::print_run_report(&report);
            Ok(ExitCode::from(report.outcome.exit_code()))
        }
        Command::Status { run_id, log_lines } => {
            let config = config::load_config(&cli.runs_dir)?;
            let store = StateStore::new(&cli.runs_dir);
            let status = pipeline::status(&store, &config, &run_id, log_lines)?;
            output::print_status(&run_id, &status);
            Ok(ExitCode::SUCCESS)
        }
        Command::Unlock { run_id, force } => {
            let config = config::load_config(&cli.runs_dir)?;
            let store = StateStore::new(&cli.runs_dir);
            match pipeline::unlock(&store, &config, &run_id, force)? {
                UnlockOutcome::NotLocked => println!("Run {run_id} is not locked"),
                UnlockOutcome::Removed => println!("Removed lock of run {run_id}"),
                UnlockOutcome::Refused(holder) => {
                    eprintln!(
                        "Run {run_id} is locked by a live process: {} (pid {} on {}). Use --force to remove it anyway.",
                        holder.owner, holder.pid, holder.hostname
                    );
                    return Ok(ExitCode::from(EXIT_FATAL));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// First SIGINT/SIGTERM cancels cooperatively; a second one exits at once.
fn register_signals(cancel: &CancelToken) -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::flag;

    for signal in [SIGINT, SIGTERM] {
        // Order matters: the shutdown hook must see the flag before it is set
        flag::register_conditional_shutdown(signal, 130, cancel.flag())?;
        flag::register(signal, cancel.flag())?;
    }
    Ok(())
}

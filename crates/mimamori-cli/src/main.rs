use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mimamori::{ProgramFile, Supervisor};
use owo_colors::OwoColorize;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Parser)]
#[command(name = "mimamori", version, about = "Run one program under supervision")]
struct Cli {
	/// Log supervisor activity at debug level
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Start a program and supervise it until it exits or Ctrl-C
	Run(RunArgs),
	/// Validate a program file and print what would run
	Check {
		/// Path to a TOML program file
		config: PathBuf,
	},
}

#[derive(Debug, clap::Args)]
struct RunArgs {
	/// TOML program file; flags override its values
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Working directory for the program
	#[arg(short, long)]
	dir: Option<PathBuf>,

	/// Also terminate every other instance of the program on stop
	#[arg(long)]
	kill_all: bool,

	/// Program followed by its arguments
	#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
	command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();

	let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_writer(std::io::stderr)
		.init();

	let result = match cli.command {
		Command::Run(args) => cmd_run(args).await,
		Command::Check { config } => cmd_check(&config),
	};

	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			eprintln!("{} {}", "error:".red().bold(), e);
			ExitCode::FAILURE
		}
	}
}

fn resolve(args: &RunArgs) -> mimamori::Result<ProgramFile> {
	let mut file = match &args.config {
		Some(path) => ProgramFile::load(path)?,
		None => ProgramFile::default(),
	};

	if let Some((program, rest)) = args.command.split_first() {
		file.program = program.clone();
		file.args = rest.to_vec();
	}
	if let Some(ref dir) = args.dir {
		file.working_dir = Some(dir.display().to_string());
	}
	if args.kill_all {
		file.kill_all_on_stop = true;
	}

	if file.program.is_empty() {
		return Err(mimamori::Error::Config(
			"no program given; pass one after `run` or set `program` in --config".into(),
		));
	}
	Ok(file)
}

/// Upper bound on waiting for the completion line once the child has exited.
/// Covers the supervisor's own output drain plus scheduling slack.
const COMPLETION_WAIT: Duration = Duration::from_secs(2);

async fn cmd_run(args: RunArgs) -> mimamori::Result<()> {
	let file = resolve(&args)?;
	let (exit_tx, exit_rx) = watch::channel(false);
	let sup = Supervisor::new(file.into_config(exit_rx, Some(Box::new(std::io::stdout()))));
	let mut feed = sup.output_sink().subscribe();

	sup.start().await?;
	eprintln!(
		"{} {} (pid {})",
		"started".green().bold(),
		sup.program().display(),
		sup.pid().await
	);

	let interrupted = tokio::select! {
		_ = wait_for_exit(&sup) => false,
		_ = tokio::signal::ctrl_c() => true,
	};

	if interrupted {
		tracing::info!("interrupt received");
		let _ = exit_tx.send(true);
		wait_for_exit(&sup).await;
	}

	// The child is reaped before its trailing output lands in the sink.
	if !wait_for_completion(&mut feed, COMPLETION_WAIT).await {
		tracing::warn!("output did not drain within {:?}", COMPLETION_WAIT);
	}

	if interrupted {
		eprintln!("{} {}", "stopped".yellow().bold(), sup.program().display());
	} else {
		eprintln!("{} {}", "exited".dimmed(), sup.program().display());
	}
	Ok(())
}

/// Waits until a chunk carrying the supervisor's completion line arrives.
/// Returns false on timeout or when the feed closes first.
async fn wait_for_completion(feed: &mut broadcast::Receiver<Vec<u8>>, limit: Duration) -> bool {
	let seen = async {
		loop {
			match feed.recv().await {
				Ok(chunk) if is_completion(&chunk) => return true,
				Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
				Err(broadcast::error::RecvError::Closed) => return false,
			}
		}
	};
	tokio::time::timeout(limit, seen).await.unwrap_or(false)
}

fn is_completion(chunk: &[u8]) -> bool {
	let text = String::from_utf8_lossy(chunk);
	text.starts_with("App: ") && (text.contains(" closed successfully") || text.contains(" closed with error: "))
}

async fn wait_for_exit(sup: &Arc<Supervisor>) {
	while sup.is_running().await {
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
}

fn cmd_check(path: &std::path::Path) -> mimamori::Result<()> {
	let file = ProgramFile::load(path)?;
	if file.program.is_empty() {
		return Err(mimamori::Error::Config(format!("{}: `program` is required", path.display())));
	}

	eprintln!("{} {}", "program".bold(), file.program);
	if !file.args.is_empty() {
		eprintln!("{} {}", "args".bold(), file.args.join(" "));
	}
	eprintln!(
		"{} {}",
		"dir".bold(),
		file.working_dir.as_deref().unwrap_or("(current)")
	);
	if file.kill_all_on_stop {
		eprintln!("{} on", "kill-all".bold());
	}
	Ok(())
}

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;

use crate::error::{filter_gone, Error, Result};
use crate::latch::Latch;
use crate::output::{Forward, OutputSink};
use crate::sweep;
use crate::terminate::{self, Graceful};

/// How long a process gets to exit after SIGTERM before it is killed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(3);

// Upper bound on waiting for the output copiers once the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Computes the child's arguments; called again on every start.
pub type ArgsProvider = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

type KillReply = oneshot::Sender<io::Result<()>>;

pub struct SupervisorConfig {
	pub program: PathBuf,
	pub args: Option<ArgsProvider>,
	/// `None` (or an empty path) inherits the host's working directory.
	pub working_dir: Option<PathBuf>,
	/// Publishing `true` stops the current run.
	pub exit_signal: watch::Receiver<bool>,
	/// Receives a copy of all child output.
	pub forward: Option<Forward>,
	/// Also terminate every other instance of `program` on stop.
	pub kill_all_on_stop: bool,
}

/// Supervises one child process at a time.
///
/// `start` launches the configured program, replacing any previous run.
/// `stop` sends SIGTERM, waits up to [`GRACE_PERIOD`], then kills.
pub struct Supervisor {
	program: PathBuf,
	args: Option<ArgsProvider>,
	working_dir: Option<PathBuf>,
	exit_signal: watch::Receiver<bool>,
	kill_all_on_stop: bool,
	state: RwLock<RunState>,
	output: OutputSink,
	runs: AtomicU64,
}

#[derive(Default)]
struct RunState {
	running: bool,
	has_waited: bool,
	current: Option<RunHandle>,
}

struct RunHandle {
	run: u64,
	pid: u32,
	/// Flips to true once the wait task has reaped the child.
	exited: watch::Receiver<bool>,
	kill: Option<oneshot::Sender<KillReply>>,
	latch: Arc<Latch>,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig) -> Arc<Self> {
		let output = match config.forward {
			Some(forward) => OutputSink::with_forward(forward),
			None => OutputSink::new(),
		};
		let working_dir = config.working_dir.filter(|d| !d.as_os_str().is_empty());

		Arc::new(Self {
			program: config.program,
			args: config.args,
			working_dir,
			exit_signal: config.exit_signal,
			kill_all_on_stop: config.kill_all_on_stop,
			state: RwLock::new(RunState::default()),
			output,
			runs: AtomicU64::new(0),
		})
	}

	pub fn program(&self) -> &Path {
		&self.program
	}

	pub async fn is_running(&self) -> bool {
		self.state.read().await.running
	}

	/// OS pid of the current run, or 0 when nothing is running.
	pub async fn pid(&self) -> u32 {
		let state = self.state.read().await;
		match &state.current {
			Some(handle) if state.running => handle.pid,
			_ => 0,
		}
	}

	/// Everything captured so far, across runs.
	pub async fn output(&self) -> String {
		self.output.contents().await
	}

	pub fn output_sink(&self) -> OutputSink {
		self.output.clone()
	}

	/// Launches the program, stopping any previous run first.
	pub async fn start(self: &Arc<Self>) -> Result<()> {
		let mut state = self.state.write().await;

		if let Err(e) = self.stop_locked(&mut state).await {
			tracing::warn!("error stopping previous run of {}: {}", self.program.display(), e);
		}
		state.running = false;
		state.has_waited = false;
		state.current = None;

		if self.program.as_os_str().is_empty() {
			return Err(Error::EmptyProgram);
		}

		let args = self.args.as_ref().map(|provide| provide()).unwrap_or_default();
		let mut cmd = Command::new(&self.program);
		cmd.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped());
		if let Some(ref dir) = self.working_dir {
			cmd.current_dir(dir);
		}

		let mut child = cmd.spawn().map_err(|source| Error::Launch {
			program: self.program.clone(),
			source,
		})?;

		let pid = child.id().unwrap_or(0);
		let run = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
		tracing::info!("started {} (pid {}, run {})", self.program.display(), pid, run);

		let mut copiers = Vec::with_capacity(2);
		if let Some(stdout) = child.stdout.take() {
			copiers.push(tokio::spawn(pipe_output(stdout, self.output.clone())));
		}
		if let Some(stderr) = child.stderr.take() {
			copiers.push(tokio::spawn(pipe_output(stderr, self.output.clone())));
		}

		let latch = Arc::new(Latch::new());
		let (kill_tx, kill_rx) = oneshot::channel();
		let (exited_tx, exited_rx) = watch::channel(false);

		state.running = true;
		state.current = Some(RunHandle {
			run,
			pid,
			exited: exited_rx,
			kill: Some(kill_tx),
			latch: Arc::clone(&latch),
		});

		let mut signal = self.exit_signal.clone();
		// Only signals published after this run started count.
		signal.borrow_and_update();
		tokio::spawn(listen_for_exit(Arc::downgrade(self), run, signal, Arc::clone(&latch)));

		tokio::spawn(watch_run(
			Arc::downgrade(self),
			RunWatch {
				run,
				program: self.program.clone(),
				child,
				kill: kill_rx,
				exited: exited_tx,
				latch,
				copiers,
				output: self.output.clone(),
			},
		));

		Ok(())
	}

	/// Stops the current run. Safe to call at any time, from any task.
	pub async fn stop(&self) -> Result<()> {
		let mut state = self.state.write().await;
		self.stop_locked(&mut state).await
	}

	async fn stop_run(&self, run: u64) -> Result<()> {
		let mut state = self.state.write().await;
		if state.current.as_ref().map(|h| h.run) != Some(run) {
			return Ok(());
		}
		self.stop_locked(&mut state).await
	}

	async fn stop_locked(&self, state: &mut RunState) -> Result<()> {
		let stopped = stop_tracked(&self.program, state).await;
		if !self.kill_all_on_stop {
			return stopped;
		}
		let swept = sweep::kill_all(&self.program, GRACE_PERIOD).await;
		stopped.and(swept.map(|_| ()))
	}

	async fn mark_exited(&self, run: u64) {
		let mut state = self.state.write().await;
		if state.current.as_ref().map(|h| h.run) == Some(run) {
			state.running = false;
			state.has_waited = true;
			tracing::debug!("run {} of {} exited", run, self.program.display());
		}
	}
}

impl Drop for Supervisor {
	fn drop(&mut self) {
		let state = self.state.get_mut();
		if let Some(handle) = state.current.as_mut() {
			handle.latch.close();
			if state.running {
				if let Some(kill) = handle.kill.take() {
					let (reply, _) = oneshot::channel();
					let _ = kill.send(reply);
				}
			}
		}
	}
}

async fn stop_tracked(program: &Path, state: &mut RunState) -> Result<()> {
	if !state.running || state.has_waited {
		state.running = false;
		return Ok(());
	}
	let Some(handle) = state.current.as_mut() else {
		state.running = false;
		return Ok(());
	};
	// Observers see the run as stopped from here on.
	state.running = false;
	let already_exited = *handle.exited.borrow();
	if already_exited {
		return Ok(());
	}

	let pid = handle.pid;
	let mut exited = handle.exited.clone();
	let kill = handle.kill.take();
	tracing::info!("stopping {} (pid {})", program.display(), pid);

	match terminate::platform().request_exit(pid) {
		Ok(Graceful::Gone) => return Ok(()),
		Ok(Graceful::Requested) => {
			if reaped_within(&mut exited, GRACE_PERIOD).await {
				return Ok(());
			}
			tracing::warn!(
				"{} (pid {}) still alive after {:?}, killing",
				program.display(),
				pid,
				GRACE_PERIOD
			);
		}
		Ok(Graceful::Unsupported) => {}
		Err(source) => return Err(Error::Terminate { pid, source }),
	}

	force_kill(kill).await.map_err(|source| Error::Terminate { pid, source })?;
	reaped_within(&mut exited, GRACE_PERIOD).await;
	Ok(())
}

async fn reaped_within(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
	tokio::time::timeout(limit, exited.wait_for(|done| *done))
		.await
		.map(|reaped| reaped.is_ok())
		.unwrap_or(false)
}

/// Asks the wait task to kill its child and reports the outcome.
async fn force_kill(kill: Option<oneshot::Sender<KillReply>>) -> io::Result<()> {
	let Some(kill) = kill else {
		return Ok(());
	};
	let (reply_tx, reply_rx) = oneshot::channel();
	if kill.send(reply_tx).is_err() {
		// Wait task is gone, so the child has been reaped.
		return Ok(());
	}
	reply_rx.await.unwrap_or(Ok(()))
}

async fn listen_for_exit(
	supervisor: Weak<Supervisor>,
	run: u64,
	mut signal: watch::Receiver<bool>,
	latch: Arc<Latch>,
) {
	tokio::select! {
		requested = exit_requested(&mut signal) => {
			if !requested {
				return;
			}
			if let Some(sup) = supervisor.upgrade() {
				tracing::info!("exit signal received, stopping {}", sup.program.display());
				if let Err(e) = sup.stop_run(run).await {
					tracing::warn!("stop on exit signal failed: {}", e);
				}
			}
			latch.close();
		}
		_ = latch.closed() => {}
	}
}

/// Resolves true on the next `true` published, false if the sender is gone.
async fn exit_requested(signal: &mut watch::Receiver<bool>) -> bool {
	loop {
		if signal.changed().await.is_err() {
			return false;
		}
		if *signal.borrow_and_update() {
			return true;
		}
	}
}

struct RunWatch {
	run: u64,
	program: PathBuf,
	child: Child,
	kill: oneshot::Receiver<KillReply>,
	exited: watch::Sender<bool>,
	latch: Arc<Latch>,
	copiers: Vec<JoinHandle<()>>,
	output: OutputSink,
}

async fn watch_run(supervisor: Weak<Supervisor>, w: RunWatch) {
	let status = wait_for_exit(w.child, w.kill).await;
	let _ = w.exited.send(true);
	w.latch.close();

	if let Some(sup) = supervisor.upgrade() {
		sup.mark_exited(w.run).await;
	}

	let copiers = w.copiers;
	let drain = async move {
		for copier in copiers {
			let _ = copier.await;
		}
	};
	if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
		tracing::debug!("output of run {} still open after exit", w.run);
	}

	w.output.write(completion_line(&w.program, &status).as_bytes()).await;
}

async fn wait_for_exit(
	mut child: Child,
	mut kill: oneshot::Receiver<KillReply>,
) -> io::Result<ExitStatus> {
	tokio::select! {
		status = child.wait() => return status,
		request = &mut kill => {
			// A dropped sender means the run was superseded; keep waiting.
			if let Ok(reply) = request {
				let _ = reply.send(filter_gone(child.start_kill()));
			}
		}
	}
	child.wait().await
}

pub(crate) fn completion_line(program: &Path, status: &io::Result<ExitStatus>) -> String {
	match status {
		Ok(s) if s.success() => format!("App: {} closed successfully\n", program.display()),
		Ok(s) => format!("App: {} closed with error: {}\n", program.display(), s),
		Err(e) => format!("App: {} closed with error: {}\n", program.display(), e),
	}
}

async fn pipe_output<R: tokio::io::AsyncRead + Unpin>(mut reader: R, output: OutputSink) {
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => output.write(&buf[..n]).await,
			Err(_) => break,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn idle_config(program: &str) -> (SupervisorConfig, watch::Sender<bool>) {
		let (tx, rx) = watch::channel(false);
		let config = SupervisorConfig {
			program: program.into(),
			args: None,
			working_dir: Some(PathBuf::new()),
			exit_signal: rx,
			forward: None,
			kill_all_on_stop: false,
		};
		(config, tx)
	}

	#[test]
	fn empty_working_dir_means_inherit() {
		let (config, _tx) = idle_config("true");
		let sup = Supervisor::new(config);
		assert!(sup.working_dir.is_none());
	}

	#[tokio::test]
	async fn fresh_supervisor_is_idle() {
		let (config, _tx) = idle_config("true");
		let sup = Supervisor::new(config);
		assert!(!sup.is_running().await);
		assert_eq!(sup.pid().await, 0);
		assert_eq!(sup.output().await, "");
	}

	#[tokio::test]
	async fn stop_when_idle_is_a_no_op() {
		let (config, _tx) = idle_config("true");
		let sup = Supervisor::new(config);
		assert!(sup.stop().await.is_ok());
		assert!(sup.stop().await.is_ok());
		assert!(!sup.is_running().await);
	}

	#[tokio::test]
	async fn empty_program_is_rejected() {
		let (config, _tx) = idle_config("");
		let sup = Supervisor::new(config);
		assert!(matches!(sup.start().await, Err(Error::EmptyProgram)));
		assert!(!sup.is_running().await);
	}

	#[cfg(unix)]
	#[test]
	fn completion_line_formats() {
		use std::os::unix::process::ExitStatusExt;
		let program = Path::new("/bin/app");

		let ok = completion_line(program, &Ok(ExitStatus::from_raw(0)));
		assert_eq!(ok, "App: /bin/app closed successfully\n");

		let failed = completion_line(program, &Ok(ExitStatus::from_raw(1 << 8)));
		assert_eq!(failed, "App: /bin/app closed with error: exit status: 1\n");

		let err = completion_line(program, &Err(io::Error::new(io::ErrorKind::Other, "boom")));
		assert_eq!(err, "App: /bin/app closed with error: boom\n");
	}

	#[tokio::test]
	async fn force_kill_without_wait_task_is_ok() {
		assert!(force_kill(None).await.is_ok());

		let (tx, rx) = oneshot::channel::<KillReply>();
		drop(rx);
		assert!(force_kill(Some(tx)).await.is_ok());
	}
}

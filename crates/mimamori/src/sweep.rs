//! Kill-all cleanup: find every running instance of an executable and end it.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::{ProcessStatus, System};

use crate::error::{Error, Result};
use crate::terminate::{self, Graceful};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

// Linux truncates process names to the 15 bytes of `comm`.
const COMM_LEN: usize = 15;

/// Identifies processes running a given executable.
#[derive(Debug, Clone)]
pub(crate) struct Target {
	path: Option<PathBuf>,
	name: OsString,
}

impl Target {
	pub fn new(program: &Path) -> Option<Self> {
		let name = program.file_name()?.to_os_string();
		// Bare names resolve through PATH; only a path can be compared as one.
		let path = if program.components().count() > 1 {
			Some(program.canonicalize().unwrap_or_else(|_| program.to_path_buf()))
		} else {
			None
		};
		Some(Self { path, name })
	}

	pub fn matches(&self, exe: Option<&Path>, name: &str) -> bool {
		if let Some(exe) = exe {
			match &self.path {
				Some(path) if exe == path => return true,
				None if exe.file_name() == Some(self.name.as_os_str()) => return true,
				_ => {}
			}
		}

		let Some(ours) = self.name.to_str() else {
			return false;
		};
		ours == name || (name.len() == COMM_LEN && ours.starts_with(name))
	}
}

fn find_instances(target: &Target) -> Vec<u32> {
	let own = std::process::id();
	let mut sys = System::new();
	sys.refresh_processes();
	sys.processes()
		.iter()
		.filter(|(pid, process)| {
			pid.as_u32() != own
				&& !matches!(process.status(), ProcessStatus::Zombie)
				&& target.matches(process.exe(), process.name())
		})
		.map(|(pid, _)| pid.as_u32())
		.collect()
}

async fn instances(target: &Target) -> Vec<u32> {
	let target = target.clone();
	tokio::task::spawn_blocking(move || find_instances(&target))
		.await
		.unwrap_or_default()
}

/// Terminates every process running `program`, escalating to a forced kill
/// for any still alive after `grace`. Returns how many were found.
pub(crate) async fn kill_all(program: &Path, grace: Duration) -> Result<usize> {
	let Some(target) = Target::new(program) else {
		return Ok(0);
	};

	let found = instances(&target).await;
	if found.is_empty() {
		return Ok(0);
	}
	tracing::info!("kill-all: {} instance(s) of {}", found.len(), program.display());

	let strategy = terminate::platform();
	let mut first_error: Option<Error> = None;
	let mut record = |pid: u32, result: io::Result<()>| {
		if let Err(source) = result {
			tracing::warn!("kill-all: pid {}: {}", pid, source);
			if first_error.is_none() {
				first_error = Some(Error::Terminate { pid, source });
			}
		}
	};

	let mut pending = Vec::new();
	for &pid in &found {
		match strategy.request_exit(pid) {
			Ok(Graceful::Requested) => pending.push(pid),
			Ok(Graceful::Gone) => {}
			Ok(Graceful::Unsupported) => record(pid, strategy.kill(pid)),
			Err(e) => record(pid, Err(e)),
		}
	}

	let deadline = tokio::time::Instant::now() + grace;
	while !pending.is_empty() && tokio::time::Instant::now() < deadline {
		tokio::time::sleep(POLL_INTERVAL).await;
		let alive = instances(&target).await;
		pending.retain(|pid| alive.contains(pid));
	}

	for pid in pending {
		tracing::debug!("kill-all: pid {} outlived grace period", pid);
		record(pid, strategy.kill(pid));
	}

	match first_error {
		Some(e) => Err(e),
		None => Ok(found.len()),
	}
}

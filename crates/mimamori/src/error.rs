use std::io;
use std::path::PathBuf;

/// Errors surfaced by the supervisor.
#[derive(Debug)]
pub enum Error {
	/// No executable was configured.
	EmptyProgram,
	/// The executable could not be launched.
	Launch { program: PathBuf, source: io::Error },
	/// The OS refused to signal or kill a process that is still alive.
	Terminate { pid: u32, source: io::Error },
	/// A configuration file could not be read or parsed.
	Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Error::EmptyProgram => write!(f, "no program path configured"),
			Error::Launch { program, source } => {
				write!(f, "failed to launch {}: {}", program.display(), source)
			}
			Error::Terminate { pid, source } => {
				write!(f, "failed to terminate pid {}: {}", pid, source)
			}
			Error::Config(e) => write!(f, "config error: {}", e),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Launch { source, .. } | Error::Terminate { source, .. } => Some(source),
			_ => None,
		}
	}
}

/// True when `err` only says the target process is already gone.
pub(crate) fn is_already_gone(err: &io::Error) -> bool {
	#[cfg(unix)]
	{
		if err.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32) {
			return true;
		}
	}
	// tokio reports a kill on an already reaped child as InvalidInput.
	matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::InvalidInput)
}

/// Drops already-exited errors, keeps everything else.
pub(crate) fn filter_gone(result: io::Result<()>) -> io::Result<()> {
	match result {
		Err(e) if is_already_gone(&e) => Ok(()),
		other => other,
	}
}

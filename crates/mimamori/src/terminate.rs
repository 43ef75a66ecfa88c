//! Platform termination strategies.
//!
//! Unix targets ask politely with SIGTERM before escalating to SIGKILL.
//! Everything else has no cooperative signal, so callers skip straight to a
//! forced kill.

use std::io;

/// Outcome of a graceful termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Graceful {
	/// The request was delivered; the process may still be shutting down.
	#[cfg_attr(not(unix), allow(dead_code))]
	Requested,
	/// The process was already gone.
	#[cfg_attr(not(unix), allow(dead_code))]
	Gone,
	/// The platform has no graceful request; kill instead.
	#[cfg_attr(unix, allow(dead_code))]
	Unsupported,
}

pub(crate) trait Terminate: Send + Sync {
	fn request_exit(&self, pid: u32) -> io::Result<Graceful>;

	/// Unconditional kill. A process that is already gone is not an error.
	fn kill(&self, pid: u32) -> io::Result<()>;
}

/// The strategy for the current target.
pub(crate) fn platform() -> &'static dyn Terminate {
	#[cfg(unix)]
	{
		&Signals
	}
	#[cfg(not(unix))]
	{
		&Direct
	}
}

#[cfg(unix)]
pub(crate) struct Signals;

#[cfg(unix)]
impl Signals {
	fn send(pid: u32, signal: nix::sys::signal::Signal) -> io::Result<()> {
		use nix::unistd::Pid;
		let pid = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
		nix::sys::signal::kill(Pid::from_raw(pid), signal).map_err(io::Error::from)
	}
}

#[cfg(unix)]
impl Terminate for Signals {
	fn request_exit(&self, pid: u32) -> io::Result<Graceful> {
		match Self::send(pid, nix::sys::signal::Signal::SIGTERM) {
			Ok(()) => Ok(Graceful::Requested),
			Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32) => Ok(Graceful::Gone),
			Err(e) => Err(e),
		}
	}

	fn kill(&self, pid: u32) -> io::Result<()> {
		crate::error::filter_gone(Self::send(pid, nix::sys::signal::Signal::SIGKILL))
	}
}

#[cfg(not(unix))]
pub(crate) struct Direct;

#[cfg(not(unix))]
impl Terminate for Direct {
	fn request_exit(&self, _pid: u32) -> io::Result<Graceful> {
		Ok(Graceful::Unsupported)
	}

	fn kill(&self, pid: u32) -> io::Result<()> {
		let pid = sysinfo::Pid::from_u32(pid);
		let mut sys = sysinfo::System::new();
		if !sys.refresh_process(pid) {
			return Ok(());
		}
		match sys.process(pid) {
			Some(process) if !process.kill() => Err(io::Error::new(
				io::ErrorKind::PermissionDenied,
				format!("kill refused for pid {}", pid),
			)),
			_ => Ok(()),
		}
	}
}

#[cfg(all(test, unix))]
mod tests {
	use super::*;

	#[test]
	fn signals_to_missing_pid_are_gone() {
		// pid_max on Linux tops out at 2^22; this pid cannot exist.
		let pid = 0x7fff_fff0;
		assert_eq!(platform().request_exit(pid).unwrap(), Graceful::Gone);
		assert!(platform().kill(pid).is_ok());
	}

	#[test]
	fn sigterm_stops_a_sleeping_child() {
		let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
		assert_eq!(platform().request_exit(child.id()).unwrap(), Graceful::Requested);
		let status = child.wait().unwrap();
		assert!(!status.success());
	}
}

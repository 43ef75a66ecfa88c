use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// One-way flag shared by a run's background tasks.
///
/// `close` may be called any number of times from any task; only the first
/// call flips the flag and wakes waiters.
#[derive(Debug, Default)]
pub(crate) struct Latch {
	closed: AtomicBool,
	notify: Notify,
}

impl Latch {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns true if this call closed the latch.
	pub fn close(&self) -> bool {
		let first = self
			.closed
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_ok();
		if first {
			self.notify.notify_waiters();
		}
		first
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	pub async fn closed(&self) {
		loop {
			// Registered before the check so a close in between is not missed.
			let notified = self.notify.notified();
			if self.is_closed() {
				return;
			}
			notified.await;
		}
	}
}

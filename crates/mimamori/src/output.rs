use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

const SUBSCRIBER_CAPACITY: usize = 256;

/// Destination that receives a copy of everything written to an [`OutputSink`].
///
/// Writes happen synchronously on a runtime worker while the sink's buffer
/// lock is held, so destinations should be fast or non-blocking. A slow
/// writer stalls both output copiers and every reader of the sink.
pub type Forward = Box<dyn Write + Send>;

/// Append-only capture of a child's combined stdout/stderr.
///
/// Cloning is cheap; every clone shares the same buffer. Writes optionally
/// forward to a caller-supplied destination, serialized behind its own lock.
#[derive(Clone)]
pub struct OutputSink {
	buffer: Arc<Mutex<Vec<u8>>>,
	forward: Option<Arc<Mutex<Forward>>>,
	sender: broadcast::Sender<Vec<u8>>,
}

impl OutputSink {
	pub fn new() -> Self {
		Self::build(None)
	}

	pub fn with_forward(forward: Forward) -> Self {
		Self::build(Some(forward))
	}

	fn build(forward: Option<Forward>) -> Self {
		let (sender, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
		Self {
			buffer: Arc::new(Mutex::new(Vec::new())),
			forward: forward.map(|f| Arc::new(Mutex::new(f))),
			sender,
		}
	}

	/// Appends `data` to the buffer, then forwards it.
	///
	/// Forwarding is best-effort: a failing destination never loses the
	/// buffered copy.
	pub async fn write(&self, data: &[u8]) {
		let mut buffer = self.buffer.lock().await;
		buffer.extend_from_slice(data);

		// Held under the buffer lock so forwarded bytes keep buffer order.
		if let Some(ref forward) = self.forward {
			let mut dest = forward.lock().await;
			if let Err(e) = dest.write_all(data).and_then(|_| dest.flush()) {
				tracing::trace!("output forward failed: {}", e);
			}
		}
		drop(buffer);

		let _ = self.sender.send(data.to_vec());
	}

	pub async fn contents(&self) -> String {
		let buffer = self.buffer.lock().await;
		String::from_utf8_lossy(&buffer).into_owned()
	}

	pub async fn snapshot(&self) -> Vec<u8> {
		self.buffer.lock().await.clone()
	}

	pub async fn reset(&self) {
		self.buffer.lock().await.clear();
	}

	pub async fn len(&self) -> usize {
		self.buffer.lock().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	/// Live feed of chunks written after this call.
	pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
		self.sender.subscribe()
	}
}

impl Default for OutputSink {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io;
	use std::sync::Mutex as StdMutex;

	#[derive(Clone, Default)]
	struct Shared(Arc<StdMutex<Vec<u8>>>);

	impl Write for Shared {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			self.0.lock().unwrap().extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	struct Broken;

	impl Write for Broken {
		fn write(&mut self, _: &[u8]) -> io::Result<usize> {
			Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn write_appends_and_reads_back() {
		let sink = OutputSink::new();
		assert!(sink.is_empty().await);

		sink.write(b"hello ").await;
		sink.write(b"world\n").await;

		assert_eq!(sink.contents().await, "hello world\n");
		assert_eq!(sink.len().await, 12);
	}

	#[tokio::test]
	async fn reset_clears_buffer() {
		let sink = OutputSink::new();
		sink.write(b"data").await;
		sink.reset().await;
		assert_eq!(sink.len().await, 0);
		assert_eq!(sink.contents().await, "");
	}

	#[tokio::test]
	async fn forwards_every_write() {
		let dest = Shared::default();
		let sink = OutputSink::with_forward(Box::new(dest.clone()));

		sink.write(b"one\n").await;
		sink.write(b"two\n").await;

		assert_eq!(dest.0.lock().unwrap().as_slice(), b"one\ntwo\n");
		assert_eq!(sink.contents().await, "one\ntwo\n");
	}

	#[tokio::test]
	async fn forward_failure_keeps_local_copy() {
		let sink = OutputSink::with_forward(Box::new(Broken));
		sink.write(b"kept").await;
		assert_eq!(sink.contents().await, "kept");
	}

	#[tokio::test]
	async fn concurrent_writers_do_not_interleave_chunks() {
		let dest = Shared::default();
		let sink = OutputSink::with_forward(Box::new(dest.clone()));

		let mut handles = Vec::new();
		for tag in [b'a', b'b'] {
			let sink = sink.clone();
			handles.push(tokio::spawn(async move {
				for _ in 0..200 {
					sink.write(&[tag; 16]).await;
				}
			}));
		}
		for h in handles {
			h.await.unwrap();
		}

		let local = sink.snapshot().await;
		assert_eq!(local.len(), 2 * 200 * 16);
		for chunk in local.chunks(16) {
			assert!(chunk.iter().all(|&b| b == chunk[0]));
		}
		assert_eq!(dest.0.lock().unwrap().as_slice(), local.as_slice());
	}

	#[tokio::test]
	async fn subscribers_see_new_chunks() {
		let sink = OutputSink::new();
		sink.write(b"before").await;

		let mut rx = sink.subscribe();
		sink.write(b"after").await;

		assert_eq!(rx.recv().await.unwrap(), b"after".to_vec());
	}
}

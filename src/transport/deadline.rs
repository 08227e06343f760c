use std::{
	future::Future,
	io,
	pin::Pin,
	task::{Context, Poll},
};
use tokio::time::{sleep_until, Instant, Sleep};

/// A settable point in time after which I/O in one direction fails.
#[derive(Debug, Default)]
pub(crate) struct Deadline {
	at: Option<Instant>,
	timer: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
	pub fn set(&mut self, at: Option<Instant>) {
		self.at = at;
		match (at, &mut self.timer) {
			(Some(at), Some(timer)) => timer.as_mut().reset(at),
			(Some(at), None) => self.timer = Some(Box::pin(sleep_until(at))),
			(None, _) => self.timer = None,
		}
	}

	/// Returns `true` if the deadline is set and has passed.
	pub fn is_elapsed(&self) -> bool {
		self.at.is_some_and(|at| Instant::now() >= at)
	}

	/// Registers the waker with the timer. Resolves once the deadline passes;
	/// never resolves when no deadline is set.
	pub fn poll_elapsed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
		match &mut self.timer {
			Some(timer) => timer.as_mut().poll(cx),
			None => Poll::Pending,
		}
	}

	/// Wraps a poll of the underlying I/O operation.
	///
	/// Fails immediately if the deadline has already passed. Otherwise a
	/// pending operation fails once the timer fires.
	pub fn poll_io<T>(
		&mut self,
		cx: &mut Context<'_>,
		op: impl FnOnce(&mut Context<'_>) -> Poll<io::Result<T>>,
	) -> Poll<io::Result<T>> {
		if self.is_elapsed() {
			return Poll::Ready(Err(timed_out()));
		}

		match op(cx) {
			Poll::Pending => match self.poll_elapsed(cx) {
				Poll::Ready(()) => Poll::Ready(Err(timed_out())),
				Poll::Pending => Poll::Pending,
			},
			ready => ready,
		}
	}
}

pub(crate) fn timed_out() -> io::Error {
	io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test(start_paused = true)]
	async fn expires_and_resets() {
		let mut deadline = Deadline::default();
		assert!(!deadline.is_elapsed());

		deadline.set(Some(Instant::now() + Duration::from_secs(1)));
		assert!(!deadline.is_elapsed());

		tokio::time::sleep(Duration::from_secs(2)).await;
		assert!(deadline.is_elapsed());

		let result = std::future::poll_fn(|cx| {
			deadline.poll_io(cx, |_| Poll::Ready(Ok::<_, io::Error>(())))
		})
		.await;
		assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);

		deadline.set(None);
		assert!(!deadline.is_elapsed());
	}

	#[tokio::test(start_paused = true)]
	async fn fails_pending_operations() {
		let mut deadline = Deadline::default();
		deadline.set(Some(Instant::now() + Duration::from_millis(100)));

		let result = std::future::poll_fn(|cx| {
			deadline.poll_io(cx, |_| Poll::<io::Result<()>>::Pending)
		})
		.await;
		assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
	}
}

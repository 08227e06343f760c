use std::{cmp, ops::Range, time::Duration};

/// Delay between connection attempts.
#[derive(Debug)]
pub struct HoldOff {
	min: Duration,
	max: Duration,
	cur: Option<Duration>,
}

impl HoldOff {
	pub fn new(r: Range<Duration>) -> Self {
		Self {
			min: r.start,
			max: cmp::max(r.start, r.end),
			cur: None,
		}
	}

	/// Reset the hold-off period to `min`.
	pub fn reset(&mut self) {
		self.cur = Some(self.min);
	}

	/// Increase the hold-off period.
	///
	/// If the new hold-off period is more then `max` then `max` is used.
	pub fn increase_with(&mut self, f: impl FnOnce(Duration) -> Duration) {
		self.cur = Some(match self.cur {
			None => self.min,
			Some(cur) => cmp::min(cmp::max(cur, f(cur)), self.max),
		});
	}

	#[inline]
	pub fn current(&self) -> Option<Duration> {
		self.cur
	}

	/// Sleep for the hold-off period. Any call to `wait()` before
	/// `increase_with()` is always a no-op.
	pub async fn wait(&self) {
		if let Some(duration) = self.cur {
			tokio::time::sleep(duration).await
		}
	}

	pub async fn wait_and_increase_with(&mut self, f: impl FnOnce(Duration) -> Duration) {
		self.wait().await;
		self.increase_with(f);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::time::Instant;

	#[tokio::test(start_paused = true)]
	async fn doubles_up_to_max() {
		let mut holdoff = HoldOff::new(Duration::from_millis(75)..Duration::from_millis(500));

		// The first wait never sleeps.
		let start = Instant::now();
		holdoff.wait_and_increase_with(|d| d * 2).await;
		assert_eq!(start.elapsed(), Duration::ZERO);

		let mut observed = Vec::new();
		for _ in 0..5 {
			observed.push(holdoff.current().unwrap().as_millis());
			holdoff.increase_with(|d| d * 2);
		}
		assert_eq!(observed, [75, 150, 300, 500, 500]);

		holdoff.reset();
		assert_eq!(holdoff.current(), Some(Duration::from_millis(75)));

		let start = Instant::now();
		holdoff.wait().await;
		assert_eq!(start.elapsed(), Duration::from_millis(75));
	}
}

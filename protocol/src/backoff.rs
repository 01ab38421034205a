//! Bounded exponential backoff for connection establishment (§4.5, §4.8).

use std::time::Duration;

use rand::Rng;

const INITIAL: Duration = Duration::from_millis(200);
const CAP: Duration = Duration::from_millis(3_200);

/// Give up establishing a connection after this long without any reply (§4.8).
pub const GIVE_UP_AFTER: Duration = Duration::from_secs(30);

/// Connection-level inactivity timeout: no inbound packet for this long
/// closes the connection (§4.8).
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Doubling retransmit schedule for the `Requesting` state: 200ms, 400ms,
/// 800ms, ... capped at 3,200ms.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
	next: Duration,
	elapsed: Duration,
}

impl Default for Backoff {
	fn default() -> Self {
		Self { next: INITIAL, elapsed: Duration::ZERO }
	}
}

impl Backoff {
	/// The interval to wait before the next retry, advancing the schedule.
	/// Returns `None` once `GIVE_UP_AFTER` has been exceeded. Jittered by
	/// up to 10% so that many clients retrying a handshake against the
	/// same sender don't all land on the same tick.
	pub fn advance(&mut self) -> Option<Duration> {
		if self.elapsed >= GIVE_UP_AFTER {
			return None;
		}

		let interval = self.next;
		self.elapsed += interval;
		self.next = (self.next * 2).min(CAP);

		let jitter = rand::thread_rng().gen_range(0.9..=1.0);
		Some(interval.mul_f64(jitter))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn doubles_up_to_cap() {
		let mut b = Backoff::default();
		let nominal =
			[Duration::from_millis(200), Duration::from_millis(400), Duration::from_millis(800), Duration::from_millis(1600), Duration::from_millis(3200), Duration::from_millis(3200)];

		for expected in nominal {
			let got = b.advance().unwrap();
			assert!(got <= expected, "{got:?} should never exceed the nominal {expected:?}");
			assert!(got >= expected.mul_f64(0.9), "{got:?} should be within the 10% jitter window of {expected:?}");
		}
	}

	#[test]
	fn gives_up_after_budget_exhausted() {
		let mut b = Backoff::default();
		let mut last = None;
		for _ in 0..100 {
			match b.advance() {
				Some(d) => last = Some(d),
				None => return,
			}
		}
		panic!("backoff never gave up, last interval was {last:?}");
	}
}

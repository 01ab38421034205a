//! TFRC-style rate governance (§4.7, §4.8): smoothed RTT, loss-event rate,
//! and packet pacing.

use std::time::{Duration, Instant};

/// Smoothing factor for the RTT exponential moving average (§4.8).
const RTT_ALPHA: f64 = 1.0 / 8.0;

/// Feedback cannot be scheduled more often than this, regardless of RTT (§4.8).
pub const MIN_FEEDBACK_PERIOD: Duration = Duration::from_millis(250);

/// Smoothed round-trip time, updated on every fresh sample.
#[derive(Clone, Copy, Debug)]
pub struct RttEstimator {
	srtt: Option<Duration>,
}

impl Default for RttEstimator {
	fn default() -> Self {
		Self { srtt: None }
	}
}

impl RttEstimator {
	pub fn sample(&mut self, measured: Duration) {
		self.srtt = Some(match self.srtt {
			None => measured,
			Some(prev) => {
				let prev_s = prev.as_secs_f64();
				let sample_s = measured.as_secs_f64();
				Duration::from_secs_f64((1.0 - RTT_ALPHA) * prev_s + RTT_ALPHA * sample_s)
			}
		});
	}

	pub fn get(&self) -> Option<Duration> {
		self.srtt
	}

	/// The feedback period: `max(250ms, srtt)` (§4.8), falling back to the
	/// minimum before any sample has arrived.
	pub fn feedback_period(&self) -> Duration {
		self.srtt.unwrap_or(MIN_FEEDBACK_PERIOD).max(MIN_FEEDBACK_PERIOD)
	}
}

/// Tracks the current loss-event rate as reported by the peer, or inferred
/// locally from sequence gaps.
#[derive(Clone, Copy, Debug, Default)]
pub struct LossEstimator {
	rate: f32,
}

impl LossEstimator {
	pub fn update(&mut self, rate: f32) {
		self.rate = rate.clamp(0.0, 1.0);
	}

	pub fn observe_gap(&mut self, expected: u64, received: u64) {
		if expected == 0 {
			return;
		}
		let lost = expected.saturating_sub(received) as f32 / expected as f32;
		self.rate = (self.rate * 0.75 + lost * 0.25).clamp(0.0, 1.0);
	}

	pub fn get(&self) -> f32 {
		self.rate
	}
}

/// Paces symbol emission on a connection so that the long-run send rate
/// matches `current_rate_bps` without accumulating historical debt on a
/// rate change (§4.7).
pub struct Pacer {
	next_send: Instant,
	rate_bps: u32,
}

impl Pacer {
	pub fn new(now: Instant, rate_bps: u32) -> Self {
		Self { next_send: now, rate_bps: rate_bps.max(1) }
	}

	pub fn next_send_time(&self) -> Instant {
		self.next_send
	}

	/// Change the rate effective from `now`, without touching any debt
	/// accrued under the old rate.
	pub fn set_rate(&mut self, now: Instant, rate_bps: u32) {
		self.rate_bps = rate_bps.max(1);
		if self.next_send < now {
			self.next_send = now;
		}
	}

	/// Record that a packet of `packet_size` bytes was just sent at `now`,
	/// advancing the next permitted send time.
	pub fn advance(&mut self, now: Instant, packet_size: usize) {
		let bits = packet_size as u64 * 8;
		let interval = Duration::from_secs_f64(bits as f64 / self.rate_bps as f64);
		self.next_send = (if self.next_send < now { now } else { self.next_send }) + interval;
	}
}

/// Extra repair symbols to keep sending for a block beyond its source
/// symbol count, given the peer's reported receive count (§4.4).
pub fn nack_slack(received: u32, loss_rate: f32) -> u32 {
	const MINIMUM_REPAIR: u32 = 2;
	(received as f32 * loss_rate).ceil() as u32 + MINIMUM_REPAIR
}

/// A sending rate below this is never allowed to stall the transfer entirely (§9).
pub const MINIMUM_RATE_BPS: u32 = 4_000;

/// The standard TFRC throughput equation (Floyd et al., RFC 5348 §3.1),
/// giving the sending rate in bytes/s a connection may use at the measured
/// RTT and loss-event rate. §9 marks this as the rate cap, not the sole
/// authority: the sender takes `min(receiver-requested rate, this)`.
///
/// `packet_size` is in bytes, `rtt` must be nonzero, `loss_rate` in `[0, 1]`.
pub fn tfrc_throughput_bps(packet_size: usize, rtt: Duration, loss_rate: f32) -> u32 {
	if loss_rate <= 0.0 {
		return u32::MAX;
	}

	let s = packet_size as f64;
	let r = rtt.as_secs_f64().max(0.001);
	let p = (loss_rate as f64).clamp(1e-6, 1.0);

	let t_rto = 4.0 * r;
	let denom = r * (2.0 * p / 3.0).sqrt() + t_rto * (3.0 * (3.0 * p / 8.0).sqrt()) * p * (1.0 + 32.0 * p * p);
	let bytes_per_sec = s / denom;

	((bytes_per_sec * 8.0).clamp(MINIMUM_RATE_BPS as f64, u32::MAX as f64)) as u32
}

/// The rate a sender connection should actually use: the smaller of what the
/// receiver asked for and what the TFRC equation allows, floored so the
/// transfer never fully stalls (§4.4, §9).
pub fn allowed_rate_bps(requested_bps: u32, packet_size: usize, rtt: Option<Duration>, loss_rate: f32) -> u32 {
	let Some(rtt) = rtt else { return requested_bps.max(MINIMUM_RATE_BPS) };
	let cap = tfrc_throughput_bps(packet_size, rtt, loss_rate);
	requested_bps.min(cap).max(MINIMUM_RATE_BPS)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rtt_converges_toward_repeated_sample() {
		let mut rtt = RttEstimator::default();
		rtt.sample(Duration::from_millis(100));
		for _ in 0..50 {
			rtt.sample(Duration::from_millis(200));
		}
		let got = rtt.get().unwrap().as_millis();
		assert!((190..=210).contains(&got), "expected convergence near 200ms, got {got}");
	}

	#[test]
	fn feedback_period_has_a_floor() {
		let rtt = RttEstimator::default();
		assert_eq!(rtt.feedback_period(), MIN_FEEDBACK_PERIOD);
	}

	#[test]
	fn pacer_rate_change_does_not_accumulate_debt() {
		let start = Instant::now();
		let mut pacer = Pacer::new(start, 8_000);
		pacer.advance(start, 1000);
		let busy = start + Duration::from_secs(10);
		pacer.set_rate(busy, 80_000);
		assert_eq!(pacer.next_send_time(), busy);
	}

	#[test]
	fn tfrc_has_no_cap_without_loss() {
		assert_eq!(tfrc_throughput_bps(1400, Duration::from_millis(100), 0.0), u32::MAX);
	}

	#[test]
	fn tfrc_throughput_drops_as_loss_rises() {
		let low = tfrc_throughput_bps(1400, Duration::from_millis(100), 0.01);
		let high = tfrc_throughput_bps(1400, Duration::from_millis(100), 0.2);
		assert!(high < low);
	}

	#[test]
	fn allowed_rate_floors_at_minimum() {
		let got = allowed_rate_bps(10_000_000, 1400, Some(Duration::from_millis(100)), 0.9);
		assert_eq!(got, MINIMUM_RATE_BPS);
	}

	#[test]
	fn allowed_rate_without_rtt_sample_uses_request() {
		assert_eq!(allowed_rate_bps(50_000, 1400, None, 0.0), 50_000);
	}
}

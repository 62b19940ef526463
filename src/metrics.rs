//! Throughput feed for one camera: samples the shared counters on a fixed interval and
//! reports the rate in kbit/s.
//!
//! The previous reading lives in the `CounterStore`, so a client that reconnects resumes
//! from the last value it saw. A fresh camera is seeded with its current count so the
//! first reported rate is zero.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use log::info;

use crate::common::CameraIndex;
use crate::counters::CounterStore;



#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
pub enum FeedState {
	Connecting,
	Connected,
	Sampling,
	Closed,
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Serialize)]
pub struct RateDebug {
	pub current: u32,
	pub previous: u32,
	pub delta: u32,
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Serialize)]
#[serde(untagged)]
pub enum FeedEvent {
	Connected {
		cam: CameraIndex,
		mode: String,
		connected: bool,
		bytes: u32,
		timestamp: String,
	},
	Rate {
		cam: CameraIndex,
		mode: String,
		kbps: f64,
		timestamp: String,
		debug: RateDebug,
	},
	/// Diagnostic: terminal before `Connected`, informational afterwards.
	Fault {
		cam: Option<i64>,
		mode: String,
		error: String,
		timestamp: String,
	},
}

impl FeedEvent {
	pub fn is_fault(&self) -> bool {
		matches!(self, FeedEvent::Fault { .. })
	}
}

fn now() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct MetricsFeed {
	counters: Arc<CounterStore>,
	requested: Option<i64>,
	mode: String,
	interval: Duration,
	previous: Option<u32>,
	state: FeedState,
}

impl MetricsFeed {
	/// `requested` is `None` when the client sent an unparsable camera index.
	pub fn new(counters: Arc<CounterStore>, requested: Option<i64>, mode: String, interval: Duration) -> Self {
		MetricsFeed {
			counters,
			requested,
			mode,
			interval,
			previous: None,
			state: FeedState::Connecting,
		}
	}

	#[cfg(test)]
	pub fn state(&self) -> FeedState {
		self.state
	}

	pub fn interval(&self) -> Duration {
		self.interval
	}

	fn camera(&self) -> Option<CameraIndex> {
		self.requested
			.and_then(|cam| CameraIndex::try_from(cam).ok())
			.filter(|cam| self.counters.contains(*cam))
	}

	fn fault(&self, error: String) -> FeedEvent {
		FeedEvent::Fault {
			cam: self.requested,
			mode: self.mode.clone(),
			error,
			timestamp: now(),
		}
	}

	/// Validates the camera and seeds its snapshot. On an invalid index the feed is closed
	/// and the returned fault is its last event.
	pub fn connect(&mut self) -> FeedEvent {
		let cam = match self.camera() {
			Some(cam) => cam,
			None => {
				self.state = FeedState::Closed;
				let shown = self.requested.map(|cam| cam.to_string()).unwrap_or_else(|| "?".to_string());
				return self.fault(format!(
					"Invalid camera index {} (valid range 0..{})",
					shown,
					self.counters.len()
				));
			},
		};

		self.previous = self.counters.snapshot_or_seed(cam);
		self.state = FeedState::Connected;

		FeedEvent::Connected {
			cam,
			mode: self.mode.clone(),
			connected: true,
			bytes: self.counters.read(cam).unwrap_or_default(),
			timestamp: now(),
		}
	}

	/// Takes one sample. Never yields a negative rate: a wrapped counter or a missing
	/// reading produce a fault event and the feed carries on.
	pub fn sample(&mut self) -> FeedEvent {
		let cam = match (self.state, self.camera()) {
			(FeedState::Connected | FeedState::Sampling, Some(cam)) => cam,
			_ => return self.fault("Feed is not connected".to_string()),
		};
		self.state = FeedState::Sampling;

		let current = self.counters.read(cam);
		match (current, self.previous) {
			(Some(current), Some(previous)) if current >= previous => {
				let delta = current - previous;
				let interval_ms = self.interval.as_millis().max(1) as f64;
				let kbps = (delta as f64 * 8.0 / interval_ms).max(0.0);
				self.advance(cam, current);

				FeedEvent::Rate {
					cam,
					mode: self.mode.clone(),
					kbps,
					timestamp: now(),
					debug: RateDebug { current, previous, delta },
				}
			},
			(Some(current), Some(previous)) => {
				self.advance(cam, current);
				self.fault(format!("Counter wrapped (previous {}, current {}), sample skipped", previous, current))
			},
			(Some(current), None) => {
				self.advance(cam, current);
				self.fault("No previous reading, sample skipped".to_string())
			},
			(None, _) => self.fault("Counter unavailable".to_string()),
		}
	}

	fn advance(&mut self, cam: CameraIndex, current: u32) {
		self.previous = Some(current);
		self.counters.record_snapshot(cam, current);
	}

	pub fn close(&mut self) {
		if let (FeedState::Connected | FeedState::Sampling, Some(cam)) = (self.state, self.camera()) {
			info!("Metrics feed for cam{} ({}) closed", cam, self.mode);
		}
		self.state = FeedState::Closed;
	}
}

// A disconnecting client drops the feed without reaching `close`.
impl Drop for MetricsFeed {
	fn drop(&mut self) {
		self.close();
	}
}

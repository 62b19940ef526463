//! Per-camera byte counters shared between relay sessions (writers) and metrics feeds (readers).
//!
//! Each camera owns its own atomics, so traffic on one camera never contends with another.
//! Counters are 32 bits wide and wrap silently, readers must tolerate a single wrap.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::common::CameraIndex;



const NO_SNAPSHOT: u64 = u64::MAX;

struct CameraCounter {
	bytes: AtomicU32,
	/// Last value observed by a metrics feed, `NO_SNAPSHOT` until first observed.
	previous: AtomicU64,
}

impl CameraCounter {
	fn new() -> Self {
		CameraCounter {
			bytes: AtomicU32::new(0),
			previous: AtomicU64::new(NO_SNAPSHOT),
		}
	}
}

pub struct CounterStore {
	cameras: Box<[CameraCounter]>,
}

impl CounterStore {
	pub fn new(camera_count: usize) -> Self {
		CounterStore {
			cameras: (0..camera_count).map(|_| CameraCounter::new()).collect(),
		}
	}

	pub fn len(&self) -> usize {
		self.cameras.len()
	}

	pub fn contains(&self, cam: CameraIndex) -> bool {
		cam < self.cameras.len()
	}

	/// Adds `n` bytes to the camera's counter. Returns false for an unknown camera.
	pub fn add_bytes(&self, cam: CameraIndex, n: usize) -> bool {
		match self.cameras.get(cam) {
			Some(counter) => {
				// Truncation is the mod 2^32 the counter is defined with.
				counter.bytes.fetch_add(n as u32, Ordering::Relaxed);
				true
			},
			None => false,
		}
	}

	pub fn read(&self, cam: CameraIndex) -> Option<u32> {
		self.cameras.get(cam).map(|counter| counter.bytes.load(Ordering::Relaxed))
	}

	/// Returns the camera's previous-value snapshot, seeding it with the current count on first use.
	pub fn snapshot_or_seed(&self, cam: CameraIndex) -> Option<u32> {
		let counter = self.cameras.get(cam)?;
		let current = counter.bytes.load(Ordering::Relaxed) as u64;
		match counter.previous.compare_exchange(NO_SNAPSHOT, current, Ordering::AcqRel, Ordering::Acquire) {
			Ok(_) => Some(current as u32),
			Err(existing) => Some(existing as u32),
		}
	}

	#[cfg(test)]
	pub fn snapshot(&self, cam: CameraIndex) -> Option<u32> {
		let value = self.cameras.get(cam)?.previous.load(Ordering::Acquire);
		if value == NO_SNAPSHOT {
			None
		} else {
			Some(value as u32)
		}
	}

	pub fn record_snapshot(&self, cam: CameraIndex, value: u32) {
		if let Some(counter) = self.cameras.get(cam) {
			counter.previous.store(value as u64, Ordering::Release);
		}
	}
}

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window throughput meter. Each data-connection read/write reports
/// its byte count; the speed is the windowed average, so a stalled transfer
/// decays to zero instead of showing the lifetime mean.
pub struct TransferSpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
    total_bytes: u64,
}

impl Default for TransferSpeedMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(8))
    }
}

impl TransferSpeedMeter {
    pub fn new(window: Duration) -> Self {
        TransferSpeedMeter {
            window,
            samples: VecDeque::new(),
            window_bytes: 0,
            total_bytes: 0,
        }
    }

    pub fn add_bytes(&mut self, n: u64) {
        let now = Instant::now();
        self.samples.push_back((now, n));
        self.window_bytes += n;
        self.total_bytes += n;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(t, n)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.window_bytes -= n;
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current speed in bytes per second.
    pub fn bytes_per_sec(&mut self) -> f64 {
        self.evict(Instant::now());
        if self.samples.is_empty() {
            return 0.0;
        }
        let span = self
            .samples
            .back()
            .map(|&(t, _)| t)
            .and_then(|newest| self.samples.front().map(|&(t, _)| newest.duration_since(t)))
            .unwrap_or_default();
        let secs = span.as_secs_f64().max(0.5);
        self.window_bytes as f64 / secs
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Restart metering after a pause so the stall does not drag the average.
    pub fn reset_window(&mut self) {
        self.samples.clear();
        self.window_bytes = 0;
    }
}

/// Running bytes-per-block ratio for servers that list sizes in blocks
/// (MVS, VMS). Every downloaded file with both numbers known feeds a sample;
/// the ratio then projects totals for block-sized items still in the queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockSizeEstimator {
    sample_bytes: u64,
    sample_blocks: u64,
}

/// Fallback when no sample exists yet.
const DEFAULT_BLOCK_SIZE: u64 = 512;

impl BlockSizeEstimator {
    pub fn add_sample(&mut self, bytes: u64, blocks: u64) {
        if blocks == 0 {
            return;
        }
        self.sample_bytes += bytes;
        self.sample_blocks += blocks;
    }

    pub fn bytes_per_block(&self) -> u64 {
        if self.sample_blocks == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            (self.sample_bytes / self.sample_blocks).max(1)
        }
    }

    pub fn blocks_to_bytes(&self, blocks: u64) -> u64 {
        blocks.saturating_mul(self.bytes_per_block())
    }

    pub fn has_samples(&self) -> bool {
        self.sample_blocks > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_accumulates_and_reports() {
        let mut meter = TransferSpeedMeter::new(Duration::from_secs(8));
        meter.add_bytes(1000);
        meter.add_bytes(500);
        assert_eq!(meter.total_bytes(), 1500);
        assert!(meter.bytes_per_sec() > 0.0);
        meter.reset_window();
        assert_eq!(meter.total_bytes(), 1500);
        assert_eq!(meter.bytes_per_sec(), 0.0);
    }

    #[test]
    fn estimator_defaults_then_learns() {
        let mut est = BlockSizeEstimator::default();
        assert_eq!(est.bytes_per_block(), 512);
        assert_eq!(est.blocks_to_bytes(4), 2048);
        est.add_sample(81920, 20);
        assert_eq!(est.bytes_per_block(), 4096);
        assert_eq!(est.blocks_to_bytes(3), 12288);
        assert!(est.has_samples());
    }

    #[test]
    fn estimator_ignores_zero_block_samples() {
        let mut est = BlockSizeEstimator::default();
        est.add_sample(1000, 0);
        assert!(!est.has_samples());
    }
}

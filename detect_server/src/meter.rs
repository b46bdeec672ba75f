use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Frame counters of all live streams, reset on every read.
#[derive(Default)]
pub struct Meter {
    raw_frames: AtomicU64,
    dropped_frames: AtomicU64,
    inferred_frames: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            raw_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            inferred_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_raw(&self) {
        self.raw_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_inferred(&self) {
        self.inferred_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_raw(&self) -> u64 {
        self.raw_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_dropped(&self) -> u64 {
        self.dropped_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_inferred(&self) -> u64 {
        self.inferred_frames.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let raw_frames = METER.get_reset_raw();
            let dropped_frames = METER.get_reset_dropped();
            let inferred_frames = METER.get_reset_inferred();
            let elapsed = start.elapsed().as_secs_f32();

            if raw_frames > 0 {
                log::info!(
                    "Captured frames per second: {:.2} ({} dropped)",
                    raw_frames as f32 / elapsed,
                    dropped_frames
                )
            }
            if inferred_frames > 0 {
                log::info!(
                    "Inferred frames per second: {:.2}",
                    inferred_frames as f32 / elapsed
                )
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counters_reset_on_read() {
        let meter = Meter::new();
        meter.tick_raw();
        meter.tick_raw();
        meter.tick_dropped();
        meter.tick_inferred();

        assert_eq!(meter.get_reset_raw(), 2);
        assert_eq!(meter.get_reset_dropped(), 1);
        assert_eq!(meter.get_reset_inferred(), 1);
        assert_eq!(meter.get_reset_raw(), 0);
    }
}

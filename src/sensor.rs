//! Heart-Rate Sensor Feed
//!
//! The poller reads the driver at a fixed cadence and drops each new average
//! into a single [`SampleSlot`]. The heartbeat producer takes from the slot;
//! taking clears the ready flag in the same critical section, so a sample is
//! published at most once and bursts of readings collapse to the latest.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Duration;

/// Driver polling cadence
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(160);

/// Hardware FIFO depth of the MAX30100
pub const FIFO_DEPTH: usize = 16;

/// Result of one driver poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub average: f64,
    /// Samples drained from the FIFO; zero means nothing new
    pub count: usize,
}

impl SensorReading {
    pub const EMPTY: Self = Self {
        average: 0.0,
        count: 0,
    };

    /// Mean of raw IR samples. Integer division, as the driver reports it.
    pub fn from_ir_samples(samples: &[u16]) -> Self {
        if samples.is_empty() {
            return Self::EMPTY;
        }
        let sum: u64 = samples.iter().map(|s| u64::from(*s)).sum();
        Self {
            average: (sum / samples.len() as u64) as f64,
            count: samples.len(),
        }
    }
}

/// Sensor driver contract
pub trait HeartRateSensor: Send {
    /// Drain the FIFO
    fn poll(&mut self) -> SensorReading;
}

/// Sample handed from the poller to the heartbeat producer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub ir_average: f64,
    pub sequence_id: u64,
}

#[derive(Debug, Default)]
struct SlotState {
    latest: Option<TelemetrySample>,
    next_sequence: u64,
}

/// Single-slot mailbox with a ready condition
#[derive(Debug, Default)]
pub struct SampleSlot {
    state: Mutex<SlotState>,
    ready: Notify,
}

impl SampleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new average, replacing any unread one, and raise the ready flag
    pub fn publish(&self, ir_average: f64) -> TelemetrySample {
        let sample = {
            let mut state = self.state.lock();
            let sample = TelemetrySample {
                ir_average,
                sequence_id: state.next_sequence,
            };
            state.next_sequence += 1;
            state.latest = Some(sample);
            sample
        };
        self.ready.notify_one();
        sample
    }

    /// Take the latest sample, clearing the ready flag
    pub fn take(&self) -> Option<TelemetrySample> {
        self.state.lock().latest.take()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().latest.is_some()
    }

    /// Wait for the ready flag, then take
    pub async fn wait(&self) -> TelemetrySample {
        loop {
            if let Some(sample) = self.take() {
                return sample;
            }
            self.ready.notified().await;
        }
    }
}

/// Periodic driver poller
pub struct SensorPoller<S> {
    sensor: S,
    slot: Arc<SampleSlot>,
    interval: Duration,
}

impl<S: HeartRateSensor> SensorPoller<S> {
    pub fn new(sensor: S, slot: Arc<SampleSlot>, interval: Duration) -> Self {
        Self {
            sensor,
            slot,
            interval,
        }
    }

    /// Poll once; returns whether a sample was published
    pub fn poll_once(&mut self) -> bool {
        let reading = self.sensor.poll();
        if reading.count == 0 {
            return false;
        }
        self.slot.publish(reading.average);
        true
    }

    /// Poll forever
    pub async fn run(mut self) {
        tracing::info!("Polling sensor every {}ms", self.interval.as_millis());
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;
            self.poll_once();
        }
    }
}

/// Synthetic IR signal for hosts without the sensor
pub struct SimulatedSensor {
    baseline: f64,
    phase: f64,
    /// Beats per minute of the synthetic pulse
    bpm: f64,
}

impl SimulatedSensor {
    pub fn new(bpm: f64) -> Self {
        Self {
            baseline: 50_000.0,
            phase: 0.0,
            bpm,
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(72.0)
    }
}

impl HeartRateSensor for SimulatedSensor {
    fn poll(&mut self) -> SensorReading {
        let mut rng = rand::thread_rng();
        let count = rng.gen_range(0..=FIFO_DEPTH / 2);

        // 100 Hz sample rate
        let step = self.bpm / 60.0 * std::f64::consts::TAU / 100.0;
        let samples: Vec<u16> = (0..count)
            .map(|_| {
                self.phase = (self.phase + step) % std::f64::consts::TAU;
                let value = self.baseline + 800.0 * self.phase.sin() + rng.gen_range(-50.0..50.0);
                value.clamp(0.0, f64::from(u16::MAX)) as u16
            })
            .collect();

        SensorReading::from_ir_samples(&samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    struct Scripted(VecDeque<SensorReading>);

    impl HeartRateSensor for Scripted {
        fn poll(&mut self) -> SensorReading {
            self.0.pop_front().unwrap_or(SensorReading::EMPTY)
        }
    }

    #[test]
    fn test_fifo_average_truncates() {
        let reading = SensorReading::from_ir_samples(&[100, 101, 101]);
        assert_eq!(reading.count, 3);
        assert_eq!(reading.average, 100.0);

        assert_eq!(SensorReading::from_ir_samples(&[]), SensorReading::EMPTY);
    }

    #[test]
    fn test_take_clears_flag() {
        let slot = SampleSlot::new();
        assert!(slot.take().is_none());

        slot.publish(10.0);
        assert!(slot.is_ready());
        assert_eq!(slot.take().map(|s| s.ir_average), Some(10.0));
        assert!(!slot.is_ready());
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_unread_samples_coalesce() {
        let slot = SampleSlot::new();
        slot.publish(10.0);
        slot.publish(11.0);
        slot.publish(12.0);

        let sample = slot.take().unwrap();
        assert_eq!(sample.ir_average, 12.0);
        assert_eq!(sample.sequence_id, 2);
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_wait_wakes_on_publish() {
        let slot = SampleSlot::new();
        let mut waiter = task::spawn(slot.wait());

        assert_pending!(waiter.poll());
        let published = slot.publish(55.0);

        assert!(waiter.is_woken());
        assert_ready_eq!(waiter.poll(), published);
    }

    #[test]
    fn test_empty_poll_leaves_slot_untouched() {
        let slot = Arc::new(SampleSlot::new());
        let script = VecDeque::from([
            SensorReading { average: 70.0, count: 4 },
            SensorReading::EMPTY,
        ]);
        let mut poller = SensorPoller::new(Scripted(script), slot.clone(), DEFAULT_POLL_INTERVAL);

        assert!(poller.poll_once());
        assert!(!poller.poll_once());
        assert_eq!(slot.take().map(|s| s.ir_average), Some(70.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_cadence() {
        let slot = Arc::new(SampleSlot::new());
        let script = VecDeque::from([
            SensorReading { average: 1.0, count: 1 },
            SensorReading { average: 2.0, count: 1 },
            SensorReading { average: 3.0, count: 1 },
        ]);
        let handle = tokio::spawn(SensorPoller::new(Scripted(script), slot.clone(), DEFAULT_POLL_INTERVAL).run());

        // ticks at 0, 160 and 320 ms
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(slot.take().map(|s| s.ir_average), Some(2.0));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(slot.take().map(|s| s.ir_average), Some(3.0));

        handle.abort();
    }

    #[test]
    fn test_simulated_sensor_stays_in_range() {
        let mut sensor = SimulatedSensor::default();
        for _ in 0..50 {
            let reading = sensor.poll();
            assert!(reading.count <= FIFO_DEPTH);
            if reading.count > 0 {
                assert!((45_000.0..55_000.0).contains(&reading.average));
            }
        }
    }
}

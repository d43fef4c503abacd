// Snowflake ID allocator
// 64-bit ids: [sign:1][timestamp:41][datacenter:5][machine:5][sequence:12]

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::error;

use crate::core::current_time_millis;
use crate::error::{AppError, AppResult};

pub const TIMESTAMP_BITS: u32 = 41;
pub const DATACENTER_ID_BITS: u32 = 5;
pub const MACHINE_ID_BITS: u32 = 5;
pub const SEQUENCE_BITS: u32 = 12;

pub const MAX_DATACENTER_ID: u8 = (1 << DATACENTER_ID_BITS) - 1; // 31
pub const MAX_MACHINE_ID: u8 = (1 << MACHINE_ID_BITS) - 1; // 31
pub const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1; // 4095

const MACHINE_ID_SHIFT: u32 = SEQUENCE_BITS;
const DATACENTER_ID_SHIFT: u32 = SEQUENCE_BITS + MACHINE_ID_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + MACHINE_ID_BITS + DATACENTER_ID_BITS;

/// Source of wall-clock milliseconds. Production uses [`SystemClock`]; tests
/// pin or step a manual clock to exercise same-millisecond and wrap paths.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_unix_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> i64 {
        current_time_millis()
    }
}

/// Decoded components of a snowflake id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeParts {
    /// Milliseconds since the allocator's custom epoch.
    pub timestamp: i64,
    pub datacenter_id: u8,
    pub machine_id: u8,
    pub sequence: u16,
}

impl SnowflakeParts {
    /// Wall-clock instant the id was generated at, given the deployment epoch.
    pub fn generated_at(&self, epoch_ms: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp + epoch_ms)
    }
}

#[derive(Debug)]
struct AllocatorState {
    last_timestamp: i64,
    sequence: u16,
}

/// Allocator for one `(datacenter, machine)` pair. All state mutation happens
/// under a single mutex, so a shared instance emits strictly increasing ids.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    datacenter_id: u8,
    machine_id: u8,
    epoch_ms: i64,
    clock: Arc<dyn Clock>,
    state: Mutex<AllocatorState>,
}

impl SnowflakeGenerator {
    pub fn new(datacenter_id: u8, machine_id: u8, epoch_ms: i64) -> AppResult<Self> {
        Self::with_clock(datacenter_id, machine_id, epoch_ms, Arc::new(SystemClock))
    }

    pub fn with_clock(
        datacenter_id: u8,
        machine_id: u8,
        epoch_ms: i64,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        if datacenter_id > MAX_DATACENTER_ID {
            return Err(AppError::Configuration(format!(
                "Datacenter ID must be between 0 and {}",
                MAX_DATACENTER_ID
            )));
        }
        if machine_id > MAX_MACHINE_ID {
            return Err(AppError::Configuration(format!(
                "Machine ID must be between 0 and {}",
                MAX_MACHINE_ID
            )));
        }
        Ok(Self {
            datacenter_id,
            machine_id,
            epoch_ms,
            clock,
            state: Mutex::new(AllocatorState {
                last_timestamp: -1,
                sequence: 0,
            }),
        })
    }

    pub fn datacenter_id(&self) -> u8 {
        self.datacenter_id
    }

    pub fn machine_id(&self) -> u8 {
        self.machine_id
    }

    pub fn epoch_ms(&self) -> i64 {
        self.epoch_ms
    }

    fn now(&self) -> i64 {
        self.clock.now_unix_ms() - self.epoch_ms
    }

    /// Busy-wait until the clock passes `last_timestamp`.
    fn wait_next_millis(&self, last_timestamp: i64) -> i64 {
        let mut timestamp = self.now();
        while timestamp <= last_timestamp {
            std::hint::spin_loop();
            timestamp = self.now();
        }
        timestamp
    }

    /// Generate the next unique id.
    pub fn next_id(&self) -> AppResult<u64> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut timestamp = self.now();
        if timestamp < state.last_timestamp {
            let behind_ms = state.last_timestamp - timestamp;
            error!(
                behind_ms,
                "clock moved backwards; refusing to generate ids"
            );
            return Err(AppError::ClockRegression { behind_ms });
        }

        if timestamp == state.last_timestamp {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond.
                timestamp = self.wait_next_millis(state.last_timestamp);
            }
        } else {
            state.sequence = 0;
        }

        state.last_timestamp = timestamp;

        Ok(((timestamp as u64) << TIMESTAMP_SHIFT)
            | ((self.datacenter_id as u64) << DATACENTER_ID_SHIFT)
            | ((self.machine_id as u64) << MACHINE_ID_SHIFT)
            | state.sequence as u64)
    }

    /// Inverse bit-slicing of [`next_id`](Self::next_id).
    pub fn parse(id: u64) -> SnowflakeParts {
        SnowflakeParts {
            timestamp: (id >> TIMESTAMP_SHIFT) as i64,
            datacenter_id: ((id >> DATACENTER_ID_SHIFT) & MAX_DATACENTER_ID as u64) as u8,
            machine_id: ((id >> MACHINE_ID_SHIFT) & MAX_MACHINE_ID as u64) as u8,
            sequence: (id & MAX_SEQUENCE as u64) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};

    const EPOCH: i64 = 1_714_531_200_000;

    #[derive(Debug)]
    struct ManualClock {
        now_ms: AtomicI64,
    }

    impl ManualClock {
        fn new(now_ms: i64) -> Arc<Self> {
            Arc::new(Self {
                now_ms: AtomicI64::new(now_ms),
            })
        }

        fn advance(&self, delta_ms: i64) {
            self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_unix_ms(&self) -> i64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn id_round_trip() {
        let clock = ManualClock::new(EPOCH + 1_000);
        let generator = SnowflakeGenerator::with_clock(1, 2, EPOCH, clock).unwrap();

        let id = generator.next_id().unwrap();
        let parts = SnowflakeGenerator::parse(id);
        assert_eq!(parts.timestamp, 1_000);
        assert_eq!(parts.datacenter_id, 1);
        assert_eq!(parts.machine_id, 2);
        assert_eq!(parts.sequence, 0);

        let at = parts.generated_at(EPOCH).unwrap();
        assert_eq!(at.timestamp_millis(), EPOCH + 1_000);
    }

    #[test]
    fn sequence_increments_within_one_millisecond() {
        let clock = ManualClock::new(EPOCH + 5);
        let generator = SnowflakeGenerator::with_clock(0, 0, EPOCH, clock).unwrap();

        for expected in 0..100u16 {
            let id = generator.next_id().unwrap();
            assert_eq!(SnowflakeGenerator::parse(id).sequence, expected);
        }
    }

    #[test]
    fn sequence_wrap_waits_for_next_millisecond() {
        let clock = ManualClock::new(EPOCH + 1_000);
        let generator = Arc::new(
            SnowflakeGenerator::with_clock(1, 2, EPOCH, clock.clone()).unwrap(),
        );

        for expected in 0..=MAX_SEQUENCE {
            let parts = SnowflakeGenerator::parse(generator.next_id().unwrap());
            assert_eq!(parts.timestamp, 1_000);
            assert_eq!(parts.sequence, expected);
        }

        // The 4097th call wraps the sequence and busy-waits; unstick it from
        // another thread.
        let ticker = {
            let clock = clock.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                clock.advance(1);
            })
        };
        let parts = SnowflakeGenerator::parse(generator.next_id().unwrap());
        ticker.join().unwrap();

        assert_eq!(parts.timestamp, 1_001);
        assert_eq!(parts.sequence, 0);
    }

    #[test]
    fn clock_regression_is_fatal() {
        let clock = ManualClock::new(EPOCH + 1_000);
        let generator = SnowflakeGenerator::with_clock(0, 0, EPOCH, clock.clone()).unwrap();
        generator.next_id().unwrap();

        clock.advance(-10);
        match generator.next_id() {
            Err(AppError::ClockRegression { behind_ms }) => assert_eq!(behind_ms, 10),
            other => panic!("expected ClockRegression, got {:?}", other),
        }
    }

    #[test]
    fn ids_strictly_increase() {
        let generator = SnowflakeGenerator::new(3, 7, EPOCH).unwrap();
        let mut last = 0u64;
        for _ in 0..10_000 {
            let id = generator.next_id().unwrap();
            assert!(id > last, "ids must be strictly increasing");
            last = id;
        }
    }

    #[test]
    fn ids_unique_across_allocators() {
        let mut handles = Vec::new();
        for machine in 0..4u8 {
            handles.push(std::thread::spawn(move || {
                let generator = SnowflakeGenerator::new(1, machine, EPOCH).unwrap();
                (0..2_000)
                    .map(|_| generator.next_id().unwrap())
                    .collect::<Vec<u64>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id emitted");
            }
        }
    }

    #[test]
    fn ids_fit_in_63_bits() {
        let generator = SnowflakeGenerator::new(MAX_DATACENTER_ID, MAX_MACHINE_ID, 0).unwrap();
        for _ in 0..1_000 {
            let id = generator.next_id().unwrap();
            assert_eq!(id >> 63, 0, "sign bit must stay clear");
        }
    }

    #[test]
    fn rejects_out_of_range_configuration() {
        assert!(SnowflakeGenerator::new(32, 0, EPOCH).is_err());
        assert!(SnowflakeGenerator::new(0, 32, EPOCH).is_err());
        assert!(SnowflakeGenerator::new(31, 31, EPOCH).is_ok());
    }
}

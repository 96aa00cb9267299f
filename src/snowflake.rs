// realtime-hub/src/snowflake.rs

//! Snowflake-style 64-bit identifiers.
//!
//! Every entity the chat service creates (users, sessions, servers, channels,
//! messages) gets its ID from a [`SnowflakeGenerator`]. IDs are laid out high to
//! low as `timestamp | worker | increment`, so the IDs minted by one worker are
//! strictly increasing and coarsely sortable by creation time, with no
//! coordination between instances as long as each instance has its own worker ID.

use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Width of the millisecond timestamp field.
pub const TIMESTAMP_BITS: u32 = 42;
/// Width of the worker/node field.
pub const WORKER_BITS: u32 = 10;
/// Width of the per-millisecond increment field.
pub const INCREMENT_BITS: u32 = 64 - TIMESTAMP_BITS - WORKER_BITS;

const WORKER_SHIFT: u32 = INCREMENT_BITS;
const TIMESTAMP_SHIFT: u32 = INCREMENT_BITS + WORKER_BITS;

/// Largest worker ID that fits in the worker field.
pub const MAX_WORKER_ID: u64 = (1 << WORKER_BITS) - 1;
/// Largest increment that fits in the increment field.
pub const MAX_INCREMENT: u64 = (1 << INCREMENT_BITS) - 1;
const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

/// 2024-01-01T00:00:00Z in Unix milliseconds. Timestamps are stored relative to it.
pub const EPOCH_MS: u64 = 1_704_067_200_000;

/// Errors produced while configuring the generator or minting IDs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnowflakeError {
    /// The generator was configured twice, with an out-of-range worker ID,
    /// or used before being configured.
    #[error("snowflake configuration error: {0}")]
    Configuration(String),

    /// More than `2^INCREMENT_BITS` IDs were requested within one millisecond.
    #[error("increment overflow at timestamp {timestamp_ms}: too many IDs requested within one millisecond")]
    Overflow { timestamp_ms: u64 },

    /// The clock has run past the range of the timestamp field.
    #[error("timestamp {timestamp_ms} no longer fits in the timestamp field")]
    Exhausted { timestamp_ms: u64 },
}

/// The decomposed fields of an ID, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snowflake {
    /// Creation time in Unix milliseconds.
    pub timestamp_ms: u64,
    pub worker_id: u64,
    pub increment: u64,
}

impl Snowflake {
    /// Splits an ID into its timestamp, worker and increment fields.
    pub fn extract(id: u64) -> Self {
        Self {
            timestamp_ms: extract_timestamp(id),
            worker_id: (id >> WORKER_SHIFT) & MAX_WORKER_ID,
            increment: id & MAX_INCREMENT,
        }
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.timestamp_ms.saturating_sub(EPOCH_MS);
        let years_left = (MAX_TIMESTAMP - elapsed.min(MAX_TIMESTAMP)) as f64 / 1000.0 / 60.0 / 60.0 / 24.0 / 365.0;
        write!(
            f,
            "timestamp={} ({:.1} years left) worker={}/{} increment={}/{}",
            self.timestamp_ms, years_left, self.worker_id, MAX_WORKER_ID, self.increment, MAX_INCREMENT
        )
    }
}

/// Returns the creation time of `id` in Unix milliseconds.
pub fn extract_timestamp(id: u64) -> u64 {
    (id >> TIMESTAMP_SHIFT) + EPOCH_MS
}

#[derive(Debug, Default)]
struct Clock {
    last_timestamp: u64,
    increment: u64,
}

/// Mints strictly increasing IDs for a single worker.
///
/// The worker ID is set exactly once, either through [`SnowflakeGenerator::with_worker`]
/// or a later call to [`SnowflakeGenerator::configure`]. The timestamp and counter
/// live behind one mutex that is only held for the arithmetic.
#[derive(Debug, Default)]
pub struct SnowflakeGenerator {
    worker_id: OnceLock<u64>,
    clock: Mutex<Clock>,
}

impl SnowflakeGenerator {
    /// Creates an unconfigured generator. [`generate`](Self::generate) fails until
    /// [`configure`](Self::configure) has been called.
    pub const fn new() -> Self {
        Self {
            worker_id: OnceLock::new(),
            clock: Mutex::new(Clock {
                last_timestamp: 0,
                increment: 0,
            }),
        }
    }

    /// Creates a generator already configured for `worker_id`.
    pub fn with_worker(worker_id: u64) -> Result<Self, SnowflakeError> {
        let generator = Self::new();
        generator.configure(worker_id)?;
        Ok(generator)
    }

    /// Sets the worker ID. Fails if it is out of range or was already set.
    pub fn configure(&self, worker_id: u64) -> Result<(), SnowflakeError> {
        if worker_id > MAX_WORKER_ID {
            return Err(SnowflakeError::Configuration(format!(
                "worker ID {} exceeds maximum value of {}",
                worker_id, MAX_WORKER_ID
            )));
        }
        self.worker_id.set(worker_id).map_err(|_| {
            SnowflakeError::Configuration("worker ID has already been set".to_string())
        })?;
        debug!(worker_id, "Snowflake generator configured");
        Ok(())
    }

    /// The configured worker ID, if any.
    pub fn worker_id(&self) -> Option<u64> {
        self.worker_id.get().copied()
    }

    /// Mints a new ID from the current wall clock.
    pub fn generate(&self) -> Result<u64, SnowflakeError> {
        self.generate_at(unix_millis())
    }

    fn generate_at(&self, now_ms: u64) -> Result<u64, SnowflakeError> {
        let worker_id = self.worker_id().ok_or_else(|| {
            SnowflakeError::Configuration("worker ID has not been set".to_string())
        })?;

        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut timestamp = now_ms.saturating_sub(EPOCH_MS);
        if timestamp < clock.last_timestamp {
            // Clock went backwards; stay on the last millisecond so IDs keep increasing.
            warn!(
                now = timestamp,
                last = clock.last_timestamp,
                "System clock moved backwards"
            );
            timestamp = clock.last_timestamp;
        }
        if timestamp > MAX_TIMESTAMP {
            return Err(SnowflakeError::Exhausted { timestamp_ms: now_ms });
        }

        if timestamp == clock.last_timestamp {
            let next = clock.increment + 1;
            if next > MAX_INCREMENT {
                return Err(SnowflakeError::Overflow {
                    timestamp_ms: timestamp + EPOCH_MS,
                });
            }
            clock.increment = next;
        } else {
            clock.increment = 0;
            clock.last_timestamp = timestamp;
        }

        Ok((timestamp << TIMESTAMP_SHIFT) | (worker_id << WORKER_SHIFT) | clock.increment)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    const NOW: u64 = EPOCH_MS + 86_400_000;

    #[test]
    fn test_configure_rejects_out_of_range_worker() {
        let generator = SnowflakeGenerator::new();
        let err = generator.configure(MAX_WORKER_ID + 1).unwrap_err();
        assert!(matches!(err, SnowflakeError::Configuration(_)));
        assert_eq!(generator.worker_id(), None);
    }

    #[test]
    fn test_configure_only_once() {
        let generator = SnowflakeGenerator::new();
        generator.configure(7).unwrap();
        let err = generator.configure(8).unwrap_err();
        assert!(matches!(err, SnowflakeError::Configuration(_)));
        assert_eq!(generator.worker_id(), Some(7));
    }

    #[test]
    fn test_generate_requires_configuration() {
        let generator = SnowflakeGenerator::new();
        assert!(matches!(
            generator.generate(),
            Err(SnowflakeError::Configuration(_))
        ));
    }

    #[test]
    fn test_ids_strictly_increase() {
        let generator = SnowflakeGenerator::with_worker(3).unwrap();
        let mut previous = 0;
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            match generator.generate() {
                Ok(id) => {
                    assert!(id > previous, "{} should be greater than {}", id, previous);
                    assert!(seen.insert(id));
                    previous = id;
                }
                // A tight loop can legitimately exhaust one millisecond.
                Err(SnowflakeError::Overflow { .. }) => std::thread::yield_now(),
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }

    #[test]
    fn test_extract_round_trips_fields() {
        let generator = SnowflakeGenerator::with_worker(513).unwrap();
        let before = unix_millis();
        let id = generator.generate().unwrap();
        let after = unix_millis();

        let parts = Snowflake::extract(id);
        assert!(parts.timestamp_ms >= before && parts.timestamp_ms <= after);
        assert_eq!(parts.worker_id, 513);
        assert_eq!(extract_timestamp(id), parts.timestamp_ms);
    }

    #[test]
    fn test_overflow_within_one_millisecond() {
        let generator = SnowflakeGenerator::with_worker(1).unwrap();
        let mut errors = 0;
        let mut ids = HashSet::new();
        for _ in 0..=MAX_INCREMENT + 1 {
            match generator.generate_at(NOW) {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(SnowflakeError::Overflow { timestamp_ms }) => {
                    assert_eq!(timestamp_ms, NOW);
                    errors += 1;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(ids.len() as u64, MAX_INCREMENT + 1);

        // The next millisecond starts a fresh counter.
        let id = generator.generate_at(NOW + 1).unwrap();
        assert_eq!(Snowflake::extract(id).increment, 0);
    }

    #[test]
    fn test_clock_moving_backwards_keeps_order() {
        let generator = SnowflakeGenerator::with_worker(2).unwrap();
        let first = generator.generate_at(NOW).unwrap();
        let second = generator.generate_at(NOW - 500).unwrap();
        assert!(second > first);
        assert_eq!(Snowflake::extract(second).timestamp_ms, NOW);
        assert_eq!(Snowflake::extract(second).increment, 1);
    }

    #[test]
    fn test_concurrent_generation_is_unique() {
        let generator = Arc::new(SnowflakeGenerator::with_worker(9).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    while ids.len() < 1_000 {
                        if let Ok(id) = generator.generate() {
                            ids.push(id);
                        }
                    }
                    ids
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate ID {}", id);
            }
        }
        assert_eq!(all.len(), 8_000);
    }

    #[test]
    fn test_display_names_fields() {
        let parts = Snowflake {
            timestamp_ms: NOW,
            worker_id: 4,
            increment: 12,
        };
        let text = parts.to_string();
        assert!(text.contains("worker=4/1023"));
        assert!(text.contains("increment=12/4095"));
    }
}

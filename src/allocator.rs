// 🔢 Identifier Allocator
// Produces PREFIX + zero-padded number for a new record and inserts it.
//
// The allocator never reserves a number transactionally. It proposes one from
// the observed high-water mark, attempts the insert, and lets the store's
// UNIQUE constraint on `code` decide. A collision raises the floor and the
// attempt is retried after a backoff, up to a configured bound.

use crate::config::{AllocationStrategy, AllocatorConfig, BackoffKind};
use crate::entities::{EntityKind, NewRegistration, Registration};
use crate::error::RegistryError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// CODE FORMAT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFormat {
    pub prefix: String,
    pub width: usize,
}

impl CodeFormat {
    pub fn new(prefix: impl Into<String>, width: usize) -> Self {
        CodeFormat {
            prefix: prefix.into(),
            width,
        }
    }

    /// `format(123)` with ("ARN", 7) → "ARN0000123". Numbers wider than
    /// `width` are written in full rather than truncated.
    pub fn format(&self, number: u64) -> String {
        format!("{}{:0width$}", self.prefix, number, width = self.width)
    }

    /// Numeric suffix of a code carrying this prefix. Anything but a plain
    /// run of ASCII digits counts as 0 so one malformed row cannot break a
    /// scan or raise the floor.
    pub fn parse_suffix(&self, code: &str) -> u64 {
        code.strip_prefix(self.prefix.as_str())
            .filter(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|suffix| suffix.parse::<u64>().ok())
            .unwrap_or(0)
    }
}

/// Next number to propose: one past the larger of what was observed and the
/// floor carried over from earlier collisions.
pub fn propose_next(observed_max: u64, minimum: Option<u64>) -> u64 {
    observed_max.max(minimum.unwrap_or(0)).saturating_add(1)
}

// ============================================================================
// STORE CONTRACT
// ============================================================================

/// Result of one insert attempt. Anything not listed here is a hard error.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Registration),
    /// UNIQUE violation on `code`
    DuplicateCode,
    /// PRIMARY KEY violation: the id sequence is behind the table
    KeyDesync,
    /// Lock contention; nothing was written
    Contention,
}

/// What the allocator needs from persistent storage.
///
/// `insert_registration` must be atomic: on any outcome other than
/// `Inserted`, nothing it attempted may remain committed.
pub trait AllocationStore {
    /// Highest numeric suffix among existing codes with this prefix (0 if none)
    fn scan_max(&mut self, kind: EntityKind, format: &CodeFormat) -> Result<u64, RegistryError>;

    /// Atomically increment and return the dedicated counter for this prefix
    fn reserve_counter(&mut self, kind: EntityKind, format: &CodeFormat) -> Result<u64, RegistryError>;

    /// Raise the dedicated counter to at least `floor`
    fn raise_counter(&mut self, kind: EntityKind, format: &CodeFormat, floor: u64) -> Result<(), RegistryError>;

    fn insert_registration(
        &mut self,
        kind: EntityKind,
        code: &str,
        draft: &NewRegistration,
        actor: &str,
    ) -> Result<InsertOutcome, RegistryError>;

    /// Move the id sequence to max(id) + 1; returns the new next value
    fn resync_id_sequence(&mut self, kind: EntityKind) -> Result<i64, RegistryError>;
}

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// No sleeping between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            backoff: BackoffKind::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
        .min(self.max_delay.max(self.base_delay));

        if !self.jitter || delay.is_zero() {
            return delay;
        }

        // Uniform in [delay/2, delay] so racing requests drift apart
        let millis = delay.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
        Duration::from_millis(jittered)
    }
}

impl From<&AllocatorConfig> for RetryPolicy {
    fn from(config: &AllocatorConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            backoff: config.backoff,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

// ============================================================================
// ALLOCATOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct Allocator {
    policy: RetryPolicy,
    strategy: AllocationStrategy,
}

impl Allocator {
    pub fn new(policy: RetryPolicy, strategy: AllocationStrategy) -> Self {
        Allocator { policy, strategy }
    }

    pub fn from_config(config: &AllocatorConfig) -> Self {
        Allocator::new(RetryPolicy::from(config), config.strategy)
    }

    /// Allocate a code for `draft` and insert it.
    ///
    /// Fails with `AllocationExhausted` once `max_attempts` inserts have
    /// collided, and with `SequenceDesync` if the id sequence is still behind
    /// after one resync. The retry after a resync is not counted as an attempt.
    pub fn allocate<S: AllocationStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        format: &CodeFormat,
        draft: &NewRegistration,
        actor: &str,
    ) -> Result<Registration, RegistryError> {
        let mut floor: Option<u64> = None;
        let mut resynced = false;
        let mut failed: u32 = 0;

        while failed < self.policy.max_attempts {
            let attempt = failed + 1;
            let proposed = match self.strategy {
                AllocationStrategy::Scan => {
                    let observed = store.scan_max(kind, format)?;
                    propose_next(observed, floor)
                }
                AllocationStrategy::Counter => {
                    let reserved = store.reserve_counter(kind, format)?;
                    reserved.max(propose_next(0, floor))
                }
            };
            let code = format.format(proposed);

            match store.insert_registration(kind, &code, draft, actor)? {
                InsertOutcome::Inserted(registration) => {
                    tracing::info!(kind = %kind, code = %registration.code, id = registration.id, attempt, "allocated");
                    return Ok(registration);
                }
                InsertOutcome::DuplicateCode => {
                    let rescanned = store.scan_max(kind, format)?;
                    let next_floor = proposed.max(rescanned).max(floor.unwrap_or(0));
                    if self.strategy == AllocationStrategy::Counter {
                        store.raise_counter(kind, format, next_floor)?;
                    }
                    floor = Some(next_floor);
                    tracing::warn!(kind = %kind, code = %code, attempt, floor = next_floor, "code already taken, retrying");
                }
                InsertOutcome::KeyDesync => {
                    if resynced {
                        tracing::warn!(kind = %kind, table = kind.table(), "id sequence still behind after resync");
                        return Err(RegistryError::SequenceDesync {
                            table: kind.table().to_string(),
                        });
                    }
                    let next_id = store.resync_id_sequence(kind)?;
                    resynced = true;
                    tracing::warn!(kind = %kind, table = kind.table(), next_id, "id sequence resynced");
                    continue;
                }
                InsertOutcome::Contention => {
                    tracing::warn!(kind = %kind, code = %code, attempt, "store busy, retrying");
                }
            }

            failed += 1;
            if failed < self.policy.max_attempts {
                std::thread::sleep(self.policy.delay_for(failed));
            }
        }

        tracing::warn!(kind = %kind, prefix = %format.prefix, attempts = self.policy.max_attempts, "allocation exhausted");
        Err(RegistryError::AllocationExhausted {
            kind,
            prefix: format.prefix.clone(),
            attempts: self.policy.max_attempts,
        })
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator::from_config(&AllocatorConfig::default())
    }
}

//! Simulated in-memory storage for deterministic testing.
//!
//! This module provides an in-memory implementation of the `Storage` trait
//! with support for fault injection at various levels:
//! - Read/write errors
//! - Byte-level corruption (bit flips)
//! - Partial writes
//! - Sync failures

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::io::{Address, Storage, StorageError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability of corruption on read (0.0 - 1.0).
    pub corruption_rate: f64,
    /// Probability of partial write (0.0 - 1.0).
    pub partial_write_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            write_error_rate: 0.001,
            sync_error_rate: 0.001,
            corruption_rate: 0.001,
            partial_write_rate: 0.001,
        }
    }

    /// Create a fault config with high fault rates (for extreme testing).
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.05,
            write_error_rate: 0.05,
            sync_error_rate: 0.05,
            corruption_rate: 0.05,
            partial_write_rate: 0.05,
        }
    }
}

/// In-memory storage implementation for deterministic testing.
///
/// This implementation keeps the whole file in a byte vector and supports:
/// - Fault injection based on configurable rates
/// - Deterministic behavior via seeded RNG
/// - Direct access to the stored bytes, the way a concurrent reader
///   process would see them
///
/// # Thread Safety
///
/// This implementation is not thread-safe. For DST, we run everything
/// in a single thread, so this is fine.
pub struct SimulatedStorage {
    /// The stored bytes.
    data: Vec<u8>,

    /// Fault injection configuration.
    fault_config: FaultConfig,
    /// Random number generator for fault injection.
    rng: StdRng,

    /// Statistics for tracking.
    stats: SimulatedStorageStats,
    /// Start address of every write, in order, once enabled.
    write_log: Option<Vec<Address>>,
}

/// Statistics about simulated storage operations.
#[derive(Debug, Default, Clone)]
pub struct SimulatedStorageStats {
    /// Number of reads.
    pub reads: u64,
    /// Number of writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
    /// Number of corrupted reads returned.
    pub corrupted_reads: u64,
    /// Number of partial writes.
    pub partial_writes: u64,
}

impl SimulatedStorage {
    /// Create a new simulated storage with the given seed.
    ///
    /// The seed ensures deterministic behavior - the same seed will
    /// produce the same sequence of faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a new simulated storage with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            data: Vec::new(),
            fault_config,
            rng: StdRng::seed_from_u64(seed),
            stats: SimulatedStorageStats::default(),
            write_log: None,
        }
    }

    /// Get the current statistics.
    #[must_use]
    pub const fn stats(&self) -> &SimulatedStorageStats {
        &self.stats
    }

    /// Reset statistics.
    pub fn reset_stats(&mut self) {
        self.stats = SimulatedStorageStats::default();
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&mut self, config: FaultConfig) {
        self.fault_config = config;
    }

    /// Start recording the address of every write from now on.
    pub fn enable_write_log(&mut self) {
        self.write_log = Some(Vec::new());
    }

    /// Addresses written since the log was enabled, oldest first.
    #[must_use]
    pub fn write_log(&self) -> &[Address] {
        self.write_log.as_deref().unwrap_or_default()
    }

    /// The stored bytes, bypassing fault injection.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the stored bytes, for tests that damage the file.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Corrupt a buffer by flipping random bits.
    fn corrupt(&mut self, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        // Flip 1-8 random bits
        let num_flips = self.rng.random_range(1..=8);
        for _ in 0..num_flips {
            let byte_offset = self.rng.random_range(0..buf.len());
            let bit = self.rng.random_range(0..8u8);
            buf[byte_offset] ^= 1 << bit;
        }
    }
}

// Addresses handed to the simulator always fit in memory.
#[allow(clippy::cast_possible_truncation)]
impl Storage for SimulatedStorage {
    fn read_at(&mut self, addr: Address, buf: &mut [u8]) -> Result<(), StorageError> {
        self.stats.reads += 1;

        let end = addr.checked_add(buf.len() as u64);
        if end.is_none_or(|end| end > self.data.len() as u64) {
            return Err(StorageError::OutOfBounds {
                addr,
                len: buf.len(),
                end: self.data.len() as u64,
            });
        }

        // Check for injected read error
        if self.should_inject_fault(self.fault_config.read_error_rate) {
            self.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let start = addr as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);

        // Check for corruption
        if self.should_inject_fault(self.fault_config.corruption_rate) {
            self.stats.corrupted_reads += 1;
            self.corrupt(buf);
        }

        Ok(())
    }

    fn write_at(&mut self, addr: Address, bytes: &[u8]) -> Result<(), StorageError> {
        self.stats.writes += 1;
        if let Some(log) = self.write_log.as_mut() {
            log.push(addr);
        }

        // Check for injected write error
        if self.should_inject_fault(self.fault_config.write_error_rate) {
            self.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        let start = addr as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }

        // Check for partial write: only a prefix of the bytes lands
        let mut written = bytes.len();
        if self.should_inject_fault(self.fault_config.partial_write_rate) {
            self.stats.partial_writes += 1;
            written = self.rng.random_range(0..bytes.len().max(1));
        }

        self.data[start..start + written].copy_from_slice(&bytes[..written]);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.stats.syncs += 1;

        // Check for injected sync error
        if self.should_inject_fault(self.fault_config.sync_error_rate) {
            self.stats.injected_sync_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        // In simulated storage, sync is a no-op (writes are already "durable")
        Ok(())
    }

    fn end_of_file(&self) -> u64 {
        self.data.len() as u64
    }
}

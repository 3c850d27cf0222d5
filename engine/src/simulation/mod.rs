//! Deterministic Simulation Testing (DST) infrastructure.
//!
//! This module provides tools for testing the tree engine with:
//! - In-memory storage with fault injection
//! - Reproducible random workloads
//! - A model of the expected contents, checked after each operation
//!
//! # Design Principles
//!
//! 1. All I/O is abstracted and can be simulated
//! 2. All randomness is seeded for reproducibility
//! 3. Faults can be injected at any I/O boundary
//! 4. Given the same seed, execution is identical
//!
//! # Usage
//!
//! ```ignore
//! use engine::simulation::{Simulator, SimulatorConfig};
//!
//! let config = SimulatorConfig::new(12345).with_swmr_write();
//! let result = Simulator::new(config).run(1000);
//!
//! assert!(result.passed());
//! ```

mod simulator;
mod storage;

pub use simulator::{SimulationResult, Simulator, SimulatorConfig};
pub use storage::{FaultConfig, SimulatedStorage, SimulatedStorageStats};

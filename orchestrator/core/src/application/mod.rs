// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod build_coordinator;
pub mod morphology_loader;
pub mod worker_pool;

// Re-export services for convenience
pub use build_coordinator::{BuildCoordinator, BuildHandle, BuildOutcome};
pub use morphology_loader::{MorphologyLoader, MorphologySet};
pub use worker_pool::{WorkerLease, WorkerPool};

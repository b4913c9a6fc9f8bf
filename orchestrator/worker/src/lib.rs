// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `morph-worker` — Build Step Execution
//!
//! Runs the steps a build coordinator assigns and reports their progress as
//! protocol messages.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `StepWorkspace` layout, `StepError` |
//! | [`application`] | Application | `LocalWorker`, a `StepExecutor` for this host |
//! | [`infrastructure`] | Infrastructure | shell runner, tar archives, source export |
//!
//! ## Key Concepts
//!
//! - **Process group**: every build command leads its own process group, so
//!   cancelling a step kills the command and all of its descendants.
//! - **Duplicate assignment**: dispatching an execution that is still running
//!   answers `step-already-started` instead of starting it twice.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{local_workers, LocalWorker};

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! Morphology graph resolution and distributed build coordination.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, use cases and infrastructure adapters shared
//!   by the `morph` CLI and the worker crate

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;

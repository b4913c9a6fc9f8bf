// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! morph CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Service wiring, the wire-protocol controller, and command handlers

pub mod commands;
pub mod controller;
pub mod services;

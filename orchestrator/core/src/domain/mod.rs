// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Mod
//!
//! Provides mod functionality for the system.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Implements mod

pub mod morphology;
pub mod validation;
pub mod normalization;
pub mod specs;
pub mod graph;
pub mod protocol;
pub mod session;
pub mod events;
pub mod cache;
pub mod repository;
pub mod worker;
pub mod deployment;
pub mod node_config;

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod errors;
pub mod workspace;

pub use errors::StepError;
pub use workspace::StepWorkspace;

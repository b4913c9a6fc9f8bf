// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod local_worker;

pub use local_worker::{local_workers, LocalWorker};

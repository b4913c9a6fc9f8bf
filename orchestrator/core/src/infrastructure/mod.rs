// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod artifact_cache;
pub mod event_bus;
pub mod morphology_parser;
pub mod repositories;
pub mod wire;

pub use artifact_cache::{ArtifactCache, ArtifactWriter, HttpArtifactSource, PutOutcome};
pub use event_bus::{EventBus, EventBusError, SessionEventReceiver};
pub use morphology_parser::MorphologyParser;
pub use repositories::{GitRepositoryService, InMemoryRepositoryService};

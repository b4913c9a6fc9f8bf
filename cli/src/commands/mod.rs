// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the morph CLI

pub mod build;
pub mod config;
pub mod deploy;
pub mod graph;
pub mod morphology;
pub mod serve;

pub use self::build::BuildArgs;
pub use self::config::ConfigCommand;
pub use self::deploy::DeployCommand;
pub use self::graph::GraphArgs;
pub use self::morphology::MorphologyCommand;
pub use self::serve::ServeArgs;

use clap::Args;
use morph_core::domain::graph::MorphologyRef;
use morph_core::domain::session::BuildRequest;

/// Where to find a morphology
#[derive(Args, Debug, Clone)]
pub struct MorphologyTarget {
    /// Definitions repository (name, alias or absolute path)
    #[arg(long, env = "MORPH_DEFINITIONS_REPO")]
    pub repo: String,

    /// Branch, tag or commit of the definitions repository
    #[arg(long = "ref", default_value = "master")]
    pub git_ref: String,

    /// Morphology path without the `.morph` suffix, e.g. `systems/base-x86_64`
    #[arg(value_name = "MORPHOLOGY")]
    pub morphology: String,
}

impl MorphologyTarget {
    fn name(&self) -> &str {
        self.morphology.trim_end_matches(".morph")
    }

    pub fn reference(&self) -> MorphologyRef {
        MorphologyRef::new(&self.repo, &self.git_ref, self.name())
    }

    pub fn request(&self) -> BuildRequest {
        BuildRequest::new(&self.repo, &self.git_ref, self.name())
    }
}

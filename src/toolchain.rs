//! The seam between the engine and the language toolchain.
//!
//! The engine never decides *what* commands build a target; a toolchain
//! adapter turns a target descriptor into a full [`Makefile`] and answers
//! layout questions the cache validity checks need. Everything behind the
//! adapter (module models, compiler flag synthesis, SDK probing) is outside
//! the engine.

use crate::{config::TargetDescriptor, error::Result, makefile::Makefile, session::BuildSession};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

pub trait ToolchainAdapter: Sync {
    /// Adapter name, used in log lines.
    fn name(&self) -> &str;

    /// Plans the target from scratch, producing every action required to
    /// build it. Only invoked when no cached makefile is usable.
    fn create_makefile(
        &self,
        session: &BuildSession,
        target: &TargetDescriptor,
    ) -> Result<Makefile>;

    /// The target's current per-module source sets, compared against the
    /// snapshot recorded in a cached makefile.
    fn current_source_files(
        &self,
        target: &TargetDescriptor,
    ) -> Result<BTreeMap<String, BTreeSet<PathBuf>>>;
}

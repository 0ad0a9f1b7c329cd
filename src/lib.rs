#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{BuildError, BuildIoError, Result};

pub mod utils;

pub mod config;
pub use config::{BuildConfiguration, TargetDescriptor};

pub mod fileitem;
pub use fileitem::{FileInfo, FileItem, FileItemCache, FileRef};

pub mod action;
pub use action::{Action, ActionRecord, ActionType, LinkedAction};

pub mod depcache;
pub use depcache::{DependencyCache, DependencyInfo, ImportedModule};

pub mod history;
pub use history::ActionHistory;

pub mod actiongraph;
pub use actiongraph::{check_for_conflicts, link, ActionGraph, ConflictFields};

pub mod outdated;
pub use outdated::Outdatedness;

pub mod makefile;
pub use makefile::{EmptyWorkingSet, Makefile, WorkingSet};

pub mod executor;
pub use executor::{select_executor, ExecutionResult, ExecutionSet, Executor, LocalExecutor};

pub mod toolchain;
pub use toolchain::ToolchainAdapter;

pub mod session;
pub use session::{build, BuildResult, BuildSession};

pub mod pipeline;

pub mod cli;

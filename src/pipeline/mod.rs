//! The build-graph pipeline runtime: a declarative job graph of agents,
//! nodes and typed tasks, executed with tagged file sets flowing through
//! temp storage and gated by filesystem tokens.

pub mod context;
pub mod graph;
pub mod runtime;
pub mod storage;
pub mod task;
pub mod token;

pub use context::{ConditionEvaluator, LiteralConditions, ScriptContext};
pub use graph::{Agent, Graph, GraphBuilder, Node, Report, Trigger};
pub use runtime::{JobDriver, JobOptions, JobOutcome, NodeDisposition};
pub use storage::{TempStorage, TempStorageBlock, TempStorageFileList, TempStorageManifest};
pub use task::{standard_registry, Task, TaskBinder, TaskInfo, TaskRegistry};
pub use token::{read_owner, TokenState, TokenStore};

//! batchgrid-engine: submit job graphs to batch schedulers.
//!
//! Callers declare jobs (scalar or array) and their dependencies through an
//! [`Engine`]. The engine validates each job, tracks the run's job graph and
//! hands it to one scheduler backend, which either talks to the scheduler
//! while jobs are declared (Slurm, SGE), collects a DAG file and submits it
//! at the end (HTCondor), or runs everything on the local machine.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!   ├── Workspace (config, run layout, environment packing, scripts)
//!   ├── JobGraph (declared jobs, uniqueness, ordering)
//!   └── Backend
//!       ├── SlurmBackend ── JobIdResolver (squeue) + sbatch/sinfo
//!       ├── SgeBackend ──── JobIdResolver (qstat) + qsub
//!       ├── DagBackend ──── <job>.dag + condor_submit_dag
//!       └── LocalBackend ── thread per task, polled readiness
//! MergeNode / SizeBalancedMerge (merge trees built on top of Engine)
//! ```
//!
//! Every external program is started through a [`CommandRunner`], so the
//! whole engine can be driven against a scripted runner in tests.

pub mod backend;
pub mod catalog;
pub mod command;
pub mod engine;
pub mod error;
pub mod merge;
pub mod queue;
pub mod testing;
pub mod workspace;

pub use backend::{Backend, ExecutionSummary, FinishReport};
pub use catalog::{CredentialCheck, FileCatalog, FileEntry, LocalDirCatalog, VomsProxyCheck};
pub use command::{CommandLine, CommandOutput, CommandRunner, SystemRunner};
pub use engine::{Engine, Transfer};
pub use error::{EngineError, EngineResult};
pub use merge::{MergeNode, MergeRequest, SizeBalancedMerge};
pub use queue::{JobIdResolver, QstatResolver, SqueueResolver};
pub use workspace::Workspace;

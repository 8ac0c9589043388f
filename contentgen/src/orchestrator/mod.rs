//! Task orchestration: stage contract, executor, worker pool, client facade
//! and restart recovery.

pub mod executor;
pub mod log_sink;
pub mod recovery;
pub mod registry;
pub mod service;
pub mod stages;
pub mod worker_pool;

pub use executor::{ExecutionOutcome, Executor};
pub use log_sink::TaskLogger;
pub use recovery::{
    DEFAULT_FORCE_CANCEL_MESSAGE, PidFile, RecoveryConfig, RecoveryReport, recover_on_startup,
};
pub use registry::{ExecutionGuard, ExecutionRegistry};
pub use service::TaskService;
pub use stages::{
    HttpStage, Stage, StageContext, StageError, StageKind, StageOutput, StageSet, plan_for,
    progress_after,
};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};

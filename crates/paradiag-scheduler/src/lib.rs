// === Oracle Access ===
pub mod gate;
pub mod oracle_pool;

// === Memoized Results ===
pub mod result_cache;

// === Execution ===
pub mod task;
pub mod worker_pool;

// === Speculation ===
pub mod lookahead;

pub use gate::Gate;
pub use lookahead::{
    successors, Assumption, BranchRule, LookaheadJob, LookaheadSummary, NodeId, SpeculationNode, SpeculationTree,
    SpeculativeScheduler, Successor,
};
pub use oracle_pool::{OracleHandle, OracleLease, OraclePool};
pub use result_cache::{CacheReport, EntryStatus, Registration, Resolution, ResultCache, ResultEntry};
pub use task::{run_direct, CheckContext, CheckTask, TaskHandle, TaskState};
pub use worker_pool::{PoolJob, ShutdownOutcome, WorkerPool};

pub mod behavior;
pub mod choices;
pub mod config;
pub mod corpus;
pub mod driver;
pub mod estimator;
pub mod executor;
pub mod hub;
pub mod mutator;
pub mod queue;
pub mod report;
pub mod shrinker;
pub mod storage;
pub mod worker;

pub use behavior::{Behavior, BehaviorKind, Fingerprint, Location};
pub use choices::{Choice, ChoiceSequence};
pub use config::{ConfigError, HivefuzzConfig, StoreConfig};
pub use corpus::{CoverageChange, Corpus};
pub use driver::{DriverError, DriverSettings, Phase, TargetDriver};
pub use estimator::{EstimatorSnapshot, WorkerLifetime};
pub use executor::{Execution, Executor, InProcessExecutor, Observation, Status, StopTest, TestCase};
pub use hub::{Hub, HubError, SharedState, WorkerId};
pub use mutator::{BlackBoxMutator, CrossOverMutator, Mutator, PointMutator};
pub use queue::{ExecutionQueue, Priority};
pub use report::{Report, ReportKind};
pub use shrinker::{GreedyShrinker, Shrinker};
pub use storage::{Database, DirectoryStore, InMemoryStore, StoreError, TargetKeys};
pub use worker::{TargetFactory, Worker};

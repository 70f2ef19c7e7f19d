pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod model;
pub mod ops;
pub mod optim;
pub mod rng;
pub mod schedule;
pub mod step;
pub mod trainer;

pub use batch::{BatchPlan, BatchSource, MicroBatch, RowDataset, Split};
pub use checkpoint::{decide_save, CheckpointRecord, SaveDecision};
pub use config::{resolve, ConfigError, ConfigPatch, Dtype, RunConfig};
pub use model::{LogitTable, ParamState, ParamView, TrainableModel};
pub use schedule::{LrPhase, LrSchedule};
pub use step::{NumericalInstabilityError, StepController, StepOutcome};
pub use trainer::{IterationState, Summary, TrainError, Trainer};

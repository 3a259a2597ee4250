pub mod commands;
pub mod config;
pub mod diff;
pub mod error;
pub mod execution;
pub mod graph;
pub mod loader;
pub mod provider;
pub mod providers;
pub mod resource;
pub mod scheduler;
pub mod state;

pub use diff::{ActionKind, DiffEntry, DiffSet, diff};
pub use error::{EngineError, Result};
pub use execution::{Engine, PlanOutcome};
pub use graph::ResourceGraph;
pub use provider::{CreateResponse, PropertyPolicy, Provider, ProviderRegistry};
pub use resource::{PropertyBag, Reference, Resource, ResourceId};
pub use scheduler::{ApplyReport, ApplyStatus, Scheduler, Step, StepOp, plan_waves};
pub use state::{Lock, LockToken, ResourceRecord, StateSnapshot, StateStore};

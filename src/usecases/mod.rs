//! Application use cases. Orchestrate domain logic via ports.

pub mod conversation;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod lanes;
pub mod router;
pub mod update_source;

pub use dispatcher::{Dispatcher, KeyStatus};
pub use engine::{Engine, EngineState};
pub use executor::{Execution, ExecutionFailure, FailureCause, HandlerExecutor};
pub use lanes::{LaneWorker, Lanes};
pub use router::{Predicate, Route, RouteDecision, Router};
pub use update_source::UpdateSource;

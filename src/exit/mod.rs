// =============================================================================
// Exit Management Module
// =============================================================================
//
// Exit strategies attached to entry orders: the record types, the pure state
// machine, the persistent store, and the engine that applies machine steps
// against the broker. The monitor hosts the background loops that feed it.

pub mod engine;
pub mod machine;
pub mod monitor;
pub mod pricing;
pub mod store;
pub mod strategy;

pub use engine::{EngineError, ExitEngine, FillOutcome, TriggerCheck};
pub use store::{JsonFileStore, StrategyStore};
pub use strategy::{ExitStrategy, StrategyKind, StrategySpec, StrategyStatus};

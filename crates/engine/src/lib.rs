//! Journey execution engine — definition registry, step registry, instance
//! locking, and the state-machine-driven instance manager.

pub mod definitions;
pub mod instances;
pub mod locks;
pub mod state_machine;
pub mod steps;

pub use definitions::{DefinitionPatch, DefinitionRegistry, DefinitionSpec};
pub use instances::{DebugHook, InstanceManager, InstanceOptions, NoOpDebugHook, StepAdvance};
pub use locks::LockManager;
pub use steps::{FnExecutor, StepExecutor, StepOutput, StepRegistry};

//! Monitoring subsystem — four independent services sharing only the event
//! stream emitted by the instance manager: metrics recording, deterministic
//! A/B testing, decaying shared memory, and step-level debug tracing.

pub mod ab_testing;
pub mod debug;
pub mod memory;
pub mod metrics;

pub use ab_testing::{AbTest, AbTestEngine, AbTestSpec, AbTestStatus};
pub use debug::{DebugSession, DebugTracer, TraceLevel};
pub use memory::{MemoryRecord, MemoryStore, StoreMemoryRequest};
pub use metrics::{MetricsRecorder, MetricsSnapshot};

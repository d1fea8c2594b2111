pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use config::{ConfigResolver, EngineConfig};
pub use error::{EngineError, EngineResult};

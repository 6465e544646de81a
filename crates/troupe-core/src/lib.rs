pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod traits;
pub mod types;

pub use config::{AppConfig, ExecutorConfig, HandoffConfig, ProcessMode};
pub use error::{Result, TroupeError};
pub use event::{EventBus, FanoutSink, TracingSink};
pub use session::{Scope, ScopedValue, Session, SessionArena};
pub use types::*;

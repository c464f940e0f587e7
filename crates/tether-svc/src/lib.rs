mod keepalive;
mod redelivery;
mod source;
mod state;
mod supervisor;

pub use keepalive::{KeepAlive, TimerKeepAlive, WakeGuard};
pub use redelivery::RedeliveryPolicy;
pub use source::{FixFeed, FixSource, FixSourceError, SamplingPolicy};
pub use state::{RunStateCell, ServiceRunState};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};

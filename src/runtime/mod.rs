pub mod events;
pub mod supervisor;

pub use events::{CancelFlag, ContinueGate, EventBus, EventLevel, RunEvent};
pub use supervisor::{ApiFactory, RunHandle, Supervisor};

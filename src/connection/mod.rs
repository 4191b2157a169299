//! `CreditTrackedConnection`, its sub-state machine, and the registry
//! (spec §3a, §4.2).

mod registry;
mod state;

pub use registry::Registry;
pub use state::{ConnState, CreditTrackedConnection};

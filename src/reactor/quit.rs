//! The shutdown protocol's connection-teardown and result-building helpers
//! (spec §4.7). The two-phase `Quit` → `End` state machine itself — tracking
//! which `QuitToken` is being honored and recognizing the reactor's own
//! loopback — lives in the reactor's dispatch loop, since it is inseparable
//! from `LoopState`; this module holds the parts that don't need that state.

use crate::connection::Registry;
use crate::error::{ErrorRecord, ErrorSink};
use crate::message::EndResult;
use crate::rdma::Verbs;

use super::cm_events::begin_disconnect;

/// Starts tearing down every connection still in the registry (spec §4.7,
/// phase 1). Idempotent to call once per shutdown; the caller's `LoopState`
/// guards against calling it twice.
pub fn begin_disconnect_all<V: Verbs>(registry: &mut Registry, verbs: &mut V, errors: &mut ErrorSink) {
    for addr in registry.addrs().collect::<Vec<_>>() {
        begin_disconnect(registry, verbs, &addr, errors);
    }
}

/// Builds the final `End` payload from whatever accumulated during shutdown
/// (spec §6, §7).
pub fn end_result(errors: &[ErrorRecord]) -> EndResult {
    if errors.is_empty() {
        EndResult::no_error()
    } else {
        EndResult::syserr(ErrorSink::describe(errors))
    }
}

//! The seam between the reactor and the RDMA transport (spec §3a).
//!
//! [`Verbs`] is implemented by two backends: [`mock::MockVerbs`], an
//! in-process software fake the reactor's own tests run against, and (behind
//! the `hardware` feature) [`cm::RdmaSysVerbs`], a thin adapter over the
//! `rdma-sys` FFI bindings to `librdmacm`/`libibverbs`. Keeping the
//! control-plane logic in `reactor/` generic over this trait is how RDMA
//! client code in the wild (e.g. the `DeviceOps`-trait split seen in
//! in-kernel-bypass NIC drivers) separates hardware-dependent verb calls from
//! testable connection-management logic.

#[cfg(feature = "hardware")]
pub mod cm;
pub mod mock;
pub mod verbs;

pub use verbs::{
    CmErrorKind, CmEvent, ConnId, DeviceAttrs, MrHandle, PrivateData, QpCaps, Verbs, WcStatus,
    WorkCompletion,
};

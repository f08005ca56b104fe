//! High level emulation of the system modules applications talk to.
//!
//! [`svc`] maps handle based supervisor calls onto the object level [`kernel`] API, and
//! [`service`] holds the host implemented services published through `srv:`.

pub use kumquat_kernel as kernel;

pub mod service;
pub mod svc;

pub use self::service::{ServiceManager, SystemSettings};

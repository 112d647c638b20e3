//! `jobguard-core`: primitives for lease-based job coordination.
//!
//! This crate contains **pure** building blocks (no storage, no timers). The
//! infrastructure crate wires them to a durable store and an async runtime.

pub mod clock;
pub mod error;
pub mod id;
pub mod lock;
pub mod week;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::LeaseToken;
pub use lock::{Lease, LockId, LockRecord};
pub use week::IsoWeek;

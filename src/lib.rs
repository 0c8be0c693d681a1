//! Thread execution control for debuggers.
//!
//! The crate decides what happens when a traced thread stops: was it the
//! user's breakpoint, an intermediate step of an ongoing source line step,
//! or noise another thread caused. Stepping operations are modeled as
//! [`plan::ThreadPlan`]s stacked per [`thread::Thread`]; the process control
//! layer (registers, memory, breakpoints and unwinding) is abstracted behind
//! [`control::DebugeeControl`] and supplied by the embedding debugger.

pub mod address;
pub mod control;
pub mod error;
pub mod plan;
pub mod stop;
pub mod thread;
pub mod unwind;

pub use address::{AddressRange, RelocatedAddress};
pub use control::{DebugeeControl, SiteId, StopId};
pub use error::Error;
pub use stop::{StopInfo, StopReason, Vote};
pub use thread::{RunState, Thread, ThreadId};

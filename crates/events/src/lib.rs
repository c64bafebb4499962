//! Integration events.
//!
//! Events published by the inventory ledger to downstream subsystems (e.g. the
//! general-ledger posting pipeline). Transport is in-process: a handler is
//! invoked with an [`EventEnvelope`] after the originating movement commits.

pub mod envelope;
pub mod event;

pub use envelope::EventEnvelope;
pub use event::Event;

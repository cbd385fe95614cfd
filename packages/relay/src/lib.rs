//! Distributed execution for `foreman`.
//!
//! One coordinator accepts worker registrations, owns the pending-action
//! priority queue, and relays results back to the submitting scheduler.
//! Workers own work-stealing deques, execute actions inside the hermetic
//! sandbox, and move artifacts through a content-addressed store.
//!
//! The coordinator persists nothing beyond its in-memory view: a crash
//! loses in-flight assignments, and surviving workers simply re-register
//! and the scheduler re-dispatches.

pub mod artifact;
pub mod coordinator;
pub mod worker;

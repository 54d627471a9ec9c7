//! Collaborator contracts for the Pouch gateway.
//!
//! The gateway core only depends on the radio and cloud traits defined in
//! this crate. In-memory doubles for both live alongside them for tests and
//! simulations.

pub mod cloud;
pub mod radio;

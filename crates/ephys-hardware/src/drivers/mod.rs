//! Device drivers.
//!
//! Only simulated hardware ships with the workspace; vendor drivers implement
//! the traits in [`crate::capabilities`] out of tree.

pub mod mock;

//! Small shared utilities for the knot workspace.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod id_generator;

pub use id_generator::IdGenerator;

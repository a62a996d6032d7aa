//! Understand-first core library.
//!
//! Turns a Python codebase into a navigable understanding model: the
//! scanner builds a Repository Map of functions and call edges, the lens
//! builder narrows it to the functions around a task, a recorded trace adds
//! runtime evidence, and the tour generator orders the result into a
//! walkthrough. Every stage is a batch transform from one artifact to the
//! next.

pub mod config;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod query;
pub mod trace;

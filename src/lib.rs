//! Garbage collection decision engines for an object store whose metadata
//! lives in sharded table dumps and whose data lives on storage nodes.
//!
//! A pass is a pipeline of line-oriented stages: dumps are decoded and
//! transformed into sortable rows, sorted externally, and fed to an engine
//! that emits cleanup actions.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod services;

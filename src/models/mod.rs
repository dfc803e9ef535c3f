//! Data model of a GC pass.
//!
//! Every row type here is transient: it lives for the duration of one
//! streaming pass over a dump. Rows serialize to tab-separated lines whose
//! byte order matches their [`sort_key::SortKey`].

pub mod metadata;
pub mod mpu;
pub mod object_row;
pub mod sort_key;
pub mod storage;

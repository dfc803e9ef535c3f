//! Decision engines and the collaborators they drive.
//!
//! Everything here except `mpu_pipeline` is synchronous and pure: engines
//! take one sorted row at a time and hand back the actions it unlocked.

pub mod audit;
pub mod clients;
pub mod cruft;
pub mod decoder;
pub mod demux;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod mpu_gc;
pub mod mpu_pipeline;
pub mod object_gc;
pub mod rebalance;
pub mod transform;

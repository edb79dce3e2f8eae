//! Process spawning module
//!
//! Explicit descriptor inheritance for spawned children and the spawner seam
//! used to launch agent workers.

#[allow(dead_code)]
mod inherit;
#[allow(dead_code)]
mod spawner;

pub use inherit::*;
pub use spawner::*;

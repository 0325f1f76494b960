//! A block management layer for multi-plane, multi-die NAND flash.
//!
//! The [bml] module presents a volume of virtual units and pages on top of a
//! [nand::LowLevelDriver], and keeps it consistent across the deferred program and erase
//! errors of pipelined NAND by moving failed blocks into a [reservoir::Reservoir] and
//! replaying the operations that were lost.

pub mod bml;
pub mod error;
pub mod nand;
pub mod reservoir;

pub use bml::{BmlFlags, Volume, VolumeGuard};
pub use error::BmlError;
pub use nand::Geometry;

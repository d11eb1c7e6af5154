#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn distributed tensors.
//!
//! Describes how a logical tensor is laid out over a device mesh through per-mesh-dimension
//! [placements](sharding::Placement), and moves tensor data between those layouts with
//! collective operations.

extern crate alloc;

mod redistribute;
mod tensor;

pub mod collective;
pub mod sharding;

pub use redistribute::*;
pub use tensor::*;

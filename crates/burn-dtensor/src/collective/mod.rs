//! Collective data movement along one dimension of a device mesh.
//!
//! The [`Collective`] trait is the contract a communication backend must satisfy for tensors to
//! be resharded. Every operation is blocking and must be entered by all ranks of the group in the
//! same order; mismatched calls hang or corrupt data, they are never detected here.

#[cfg(feature = "std")]
mod local;

#[cfg(feature = "std")]
pub use local::*;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Debug;
use ndarray::{ArrayD, ArrayViewD, Zip};
use num_traits::{Num, NumCast};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type of the tensor buffers moved by collectives.
pub trait Element: Num + NumCast + PartialOrd + Copy + Send + Sync + Debug + 'static {}

impl<E> Element for E where E: Num + NumCast + PartialOrd + Copy + Send + Sync + Debug + 'static {}

/// The different ways to execute the reduce operation.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum ReduceOperation {
    /// The sum of the values.
    #[default]
    Sum,
    /// The product of the values.
    Product,
    /// The smallest of the values.
    Min,
    /// The largest of the values.
    Max,
    /// The mean of the values.
    Mean,
}

impl ReduceOperation {
    /// Reduces the contributions of every rank element-wise.
    ///
    /// All contributions must share the same shape.
    pub fn reduce<E: Element>(
        self,
        contributions: &[ArrayViewD<'_, E>],
    ) -> Result<ArrayD<E>, CollectiveError> {
        let (first, rest) = contributions
            .split_first()
            .ok_or(CollectiveError::EmptyReduction)?;

        let mut output = first.to_owned();
        for contribution in rest {
            check_shape(output.shape(), contribution.shape())?;
            Zip::from(&mut output)
                .and(contribution)
                .for_each(|acc, &value| *acc = self.combine(*acc, value));
        }

        if self == ReduceOperation::Mean {
            let count = <E as NumCast>::from(contributions.len()).ok_or(CollectiveError::ElementCast {
                count: contributions.len(),
            })?;
            output.mapv_inplace(|value| value / count);
        }

        Ok(output)
    }

    fn combine<E: Element>(self, lhs: E, rhs: E) -> E {
        match self {
            ReduceOperation::Sum | ReduceOperation::Mean => lhs + rhs,
            ReduceOperation::Product => lhs * rhs,
            ReduceOperation::Min => {
                if rhs < lhs {
                    rhs
                } else {
                    lhs
                }
            }
            ReduceOperation::Max => {
                if rhs > lhs {
                    rhs
                } else {
                    lhs
                }
            }
        }
    }
}

/// Errors reported by a collective backend.
///
/// Transport failures are surfaced unchanged; nothing at this layer retries a collective.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum CollectiveError {
    /// A buffer does not have the shape the collective expects.
    #[error("expected a buffer of shape {expected:?}, got {actual:?}")]
    BufferShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// The number of buffers does not match the group size.
    #[error("expected {expected} buffer(s) on mesh dim {mesh_dim}, got {actual}")]
    BufferCountMismatch {
        /// Mesh dimension of the group.
        mesh_dim: usize,
        /// Group size.
        expected: usize,
        /// Provided buffer count.
        actual: usize,
    },

    /// The mesh dimension is not part of the backend's mesh.
    #[error("mesh dim {mesh_dim} is out of range for a {ndim}-d mesh")]
    MeshDimOutOfRange {
        /// Requested mesh dimension.
        mesh_dim: usize,
        /// Mesh dimensionality.
        ndim: usize,
    },

    /// A reduction received no contribution.
    #[error("cannot reduce zero contributions")]
    EmptyReduction,

    /// The participant count of a mean cannot be represented by the element type.
    #[error("cannot represent participant count {count} as the element type")]
    ElementCast {
        /// Participant count.
        count: usize,
    },

    /// The underlying transport failed.
    #[error("transport failure: {message}")]
    Transport {
        /// Backend-specific description.
        message: String,
    },
}

/// Collective primitives scoped to one dimension of a device mesh.
///
/// For a given `mesh_dim`, the group of the calling rank is every rank whose mesh coordinate
/// only differs on `mesh_dim`; the position of a rank within the group is its coordinate on
/// `mesh_dim`. The source of `scatter` and `broadcast` is the rank at position `0`.
///
/// Output buffers are provided by the caller with the shape of the data they receive.
pub trait Collective<E: Element> {
    /// Sends `chunks[r]` of the source rank to the rank at position `r`, writing it to `output`.
    ///
    /// Only the source's `chunks` are read.
    fn scatter(
        &self,
        output: &mut ArrayD<E>,
        chunks: &[ArrayD<E>],
        mesh_dim: usize,
    ) -> Result<(), CollectiveError>;

    /// Gathers `input` of every rank of the group, in group order, into `outputs`.
    fn all_gather(
        &self,
        outputs: &mut [ArrayD<E>],
        input: &ArrayD<E>,
        mesh_dim: usize,
    ) -> Result<(), CollectiveError>;

    /// Reduces `chunks[r]` across the group with `op` and writes the result to `output` on the
    /// rank at position `r`.
    fn reduce_scatter(
        &self,
        output: &mut ArrayD<E>,
        chunks: &[ArrayD<E>],
        op: ReduceOperation,
        mesh_dim: usize,
    ) -> Result<(), CollectiveError>;

    /// Overwrites `buffer` with the source rank's buffer.
    fn broadcast(&self, buffer: &mut ArrayD<E>, mesh_dim: usize) -> Result<(), CollectiveError>;

    /// Reduces `buffer` across the group with `op`, in place.
    fn all_reduce(
        &self,
        buffer: &mut ArrayD<E>,
        op: ReduceOperation,
        mesh_dim: usize,
    ) -> Result<(), CollectiveError>;

    /// Whether every buffer exchanged in one collective must have the same shape.
    ///
    /// Backends that only support even collectives need chunks padded to a uniform size.
    fn requires_uniform_buffers(&self) -> bool {
        true
    }
}

pub(crate) fn check_shape(expected: &[usize], actual: &[usize]) -> Result<(), CollectiveError> {
    if expected != actual {
        return Err(CollectiveError::BufferShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

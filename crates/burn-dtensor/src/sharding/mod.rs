//! Mesh topology, placements and the distribution specification of a tensor.

mod mesh;
mod placement;
mod spec;

pub mod split;

pub use mesh::*;
pub use placement::*;
pub use spec::*;

use alloc::string::String;
use thiserror::Error;

/// Errors raised while describing or deriving the layout of a distributed tensor.
///
/// All of these are caller contract violations: they are detected when a spec is built or a
/// derived view is computed, before any collective is entered.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShardingError {
    /// The sharded tensor dimension does not exist.
    #[error("sharding dim {dim} greater than tensor ndim {ndim}")]
    ShardDimOutOfRange {
        /// Requested tensor dimension.
        dim: usize,
        /// Rank of the tensor.
        ndim: usize,
    },

    /// A dimension was split into more chunks than it has elements.
    #[error(
        "size {size} on dim {dim} must be at least as large as the number of chunks {num_chunks}"
    )]
    ChunkCountExceedsDim {
        /// Tensor dimension being split.
        dim: usize,
        /// Number of elements along that dimension.
        size: usize,
        /// Requested chunk count.
        num_chunks: usize,
    },

    /// A dimension was split into zero chunks.
    #[error("chunk count must be > 0")]
    InvalidChunkCount,

    /// A chunk index is not smaller than the chunk count.
    #[error("chunk index {index} is out of range for chunk count {num_chunks}")]
    ChunkIndexOutOfRange {
        /// Requested chunk index.
        index: usize,
        /// Chunk count.
        num_chunks: usize,
    },

    /// One tensor dimension is sharded over two mesh dimensions.
    #[error(
        "tensor dim {tensor_dim} is already sharded on mesh dim {mesh_dim}, hybrid sharding strategies (i.e. [Shard(0), Shard(0)]) are not supported"
    )]
    HybridSharding {
        /// Tensor dimension sharded twice.
        tensor_dim: usize,
        /// Mesh dimension that claimed it first.
        mesh_dim: usize,
    },

    /// Two tensor dimensions are mapped onto the same mesh dimension.
    #[error("mesh dim {mesh_dim} can't be mapped to two dimensions of the same tensor: {first} and {second}")]
    MeshDimAlreadySharded {
        /// Contested mesh dimension.
        mesh_dim: usize,
        /// Tensor dimension already mapped to it.
        first: usize,
        /// Tensor dimension that tried to map to it.
        second: usize,
    },

    /// A mesh dimension is asked to be both sharded and pending a reduction.
    #[error("mesh dim {mesh_dim} cannot be both shard and partial")]
    ShardPartialConflict {
        /// Contested mesh dimension.
        mesh_dim: usize,
    },

    /// A derivation needs the logical tensor shape but the spec carries none.
    #[error("distribution spec does not contain tensor meta")]
    MissingTensorMeta,

    /// The placement sequence does not cover every mesh dimension.
    #[error("expected {expected} placement(s), one per mesh dim, but got {actual}")]
    PlacementCountMismatch {
        /// Mesh dimensionality.
        expected: usize,
        /// Provided placement count.
        actual: usize,
    },

    /// A mesh dimension index is not part of the mesh.
    #[error("mesh dim {mesh_dim} is out of range for a {ndim}-d mesh")]
    MeshDimOutOfRange {
        /// Requested mesh dimension.
        mesh_dim: usize,
        /// Mesh dimensionality.
        ndim: usize,
    },

    /// The calling rank has no coordinate on the mesh.
    #[error("rank is not part of the mesh")]
    NotInMesh,

    /// A local buffer does not have the size its placement implies.
    #[error("local tensor has size {actual} on dim {dim}, expected {expected}")]
    LocalSizeMismatch {
        /// Tensor dimension.
        dim: usize,
        /// Size implied by the placement.
        expected: usize,
        /// Size of the buffer.
        actual: usize,
    },

    /// The tensor buffer could not be sliced or concatenated.
    #[error("tensor layout error: {message}")]
    Layout {
        /// Message reported by the array backend.
        message: String,
    },
}

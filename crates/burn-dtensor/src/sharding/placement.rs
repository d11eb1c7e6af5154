use core::fmt;

use serde::{Deserialize, Serialize};

use crate::collective::ReduceOperation;

/// Describes how a tensor relates to one dimension of the device mesh.
///
/// A distributed tensor carries one placement per mesh dimension. Placements are plain values:
/// two `Shard` placements are equal when they shard the same tensor dimension, every
/// `Replicate` is equal to every other, and two `Partial` placements are equal when they share
/// their reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    /// The given tensor dimension is split across the coordinates of the mesh dimension.
    Shard(usize),
    /// Every coordinate of the mesh dimension holds the full tensor.
    Replicate,
    /// Every coordinate holds a contribution that must be reduced with the given operation
    /// before the tensor is valid.
    Partial(ReduceOperation),
}

impl Placement {
    /// Placement sharding tensor dimension `dim`.
    pub fn shard(dim: usize) -> Self {
        Placement::Shard(dim)
    }

    /// Pending-sum placement.
    pub fn partial() -> Self {
        Placement::Partial(ReduceOperation::Sum)
    }

    /// Returns `true` for any `Shard` placement.
    pub fn is_shard(&self) -> bool {
        matches!(self, Placement::Shard(_))
    }

    /// Returns `true` if this placement shards tensor dimension `dim`.
    pub fn is_shard_on(&self, dim: usize) -> bool {
        matches!(self, Placement::Shard(d) if *d == dim)
    }

    /// Returns `true` for `Replicate`.
    pub fn is_replicate(&self) -> bool {
        matches!(self, Placement::Replicate)
    }

    /// Returns `true` for any `Partial` placement.
    pub fn is_partial(&self) -> bool {
        matches!(self, Placement::Partial(_))
    }

    /// Sharded tensor dimension, if any.
    pub fn shard_dim(&self) -> Option<usize> {
        match self {
            Placement::Shard(dim) => Some(*dim),
            _ => None,
        }
    }

    /// Pending reduction, if any.
    pub fn reduce_op(&self) -> Option<ReduceOperation> {
        match self {
            Placement::Partial(op) => Some(*op),
            _ => None,
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Shard(dim) => write!(f, "Shard(dim={dim})"),
            Placement::Replicate => write!(f, "Replicate()"),
            Placement::Partial(op) => write!(f, "Partial(reduce_op={op:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use core::hash::BuildHasher;
    use hashbrown::DefaultHashBuilder;

    #[test]
    fn test_placement_predicates() {
        let shard = Placement::shard(1);
        assert!(shard.is_shard());
        assert!(shard.is_shard_on(1));
        assert!(!shard.is_shard_on(0));
        assert!(!shard.is_replicate());
        assert!(!shard.is_partial());
        assert_eq!(shard.shard_dim(), Some(1));

        assert!(Placement::Replicate.is_replicate());
        assert!(!Placement::Replicate.is_shard());
        assert_eq!(Placement::Replicate.shard_dim(), None);

        let partial = Placement::partial();
        assert!(partial.is_partial());
        assert!(!partial.is_shard_on(0));
        assert_eq!(partial.reduce_op(), Some(ReduceOperation::Sum));
    }

    #[test]
    fn test_placement_structural_equality() {
        assert_eq!(Placement::Shard(0), Placement::shard(0));
        assert_ne!(Placement::Shard(0), Placement::Shard(1));
        assert_eq!(Placement::Replicate, Placement::Replicate);
        assert_eq!(
            Placement::Partial(ReduceOperation::Sum),
            Placement::partial()
        );
        assert_ne!(
            Placement::Partial(ReduceOperation::Sum),
            Placement::Partial(ReduceOperation::Max)
        );
        assert_ne!(Placement::Shard(0), Placement::Replicate);
    }

    #[test]
    fn test_placement_hash_is_structural() {
        let state = DefaultHashBuilder::default();
        let hash_of = |placement: Placement| state.hash_one(placement);

        assert_eq!(hash_of(Placement::Replicate), hash_of(Placement::Replicate));
        assert_eq!(hash_of(Placement::Shard(2)), hash_of(Placement::shard(2)));
        assert_eq!(
            hash_of(Placement::partial()),
            hash_of(Placement::Partial(ReduceOperation::Sum))
        );
    }

    #[test]
    fn test_placement_display() {
        assert_eq!(Placement::Shard(0).to_string(), "Shard(dim=0)");
        assert_eq!(Placement::Replicate.to_string(), "Replicate()");
        assert_eq!(Placement::partial().to_string(), "Partial(reduce_op=Sum)");
    }
}

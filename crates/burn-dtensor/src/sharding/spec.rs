use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use super::split::local_shard_size_on_dim;
use super::{DeviceMesh, Placement, ShardingError};

/// Metadata of the full, un-partitioned tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorMeta {
    /// Global shape of the tensor (across all devices).
    shape: Vec<usize>,
}

impl TensorMeta {
    /// Creates the metadata of a tensor with the given global shape.
    pub fn new<S: Into<Vec<usize>>>(shape: S) -> Self {
        Self {
            shape: shape.into(),
        }
    }

    /// Global shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Rank of the tensor.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
}

/// Describes how a tensor is distributed across the devices of a mesh.
///
/// A spec holds one [`Placement`] per mesh dimension and, optionally, the global shape of the
/// tensor. It is an immutable value: changing a placement builds a new spec. Equality and
/// hashing are structural over the mesh topology, the placements and the tensor shape, so specs
/// can be used as cache keys.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DistributionSpec<T> {
    /// Device mesh the tensor is distributed over
    mesh: Arc<DeviceMesh<T>>,
    /// Distribution on each mesh dimension
    placements: Vec<Placement>,
    /// Global tensor metadata, required to derive local shapes
    tensor_meta: Option<TensorMeta>,
}

impl<T> Clone for DistributionSpec<T> {
    fn clone(&self) -> Self {
        Self {
            mesh: self.mesh.clone(),
            placements: self.placements.clone(),
            tensor_meta: self.tensor_meta.clone(),
        }
    }
}

impl<T> DistributionSpec<T> {
    /// Creates a spec from one placement per mesh dimension.
    ///
    /// Hybrid sharding is not checked here; it is rejected by [`dim_map`](Self::dim_map).
    pub fn new(
        mesh: Arc<DeviceMesh<T>>,
        placements: Vec<Placement>,
        tensor_meta: Option<TensorMeta>,
    ) -> Result<Self, ShardingError> {
        if placements.len() != mesh.ndim() {
            return Err(ShardingError::PlacementCountMismatch {
                expected: mesh.ndim(),
                actual: placements.len(),
            });
        }
        Ok(Self {
            mesh,
            placements,
            tensor_meta,
        })
    }

    /// Creates a spec replicated on every mesh dimension.
    pub fn replicated(mesh: Arc<DeviceMesh<T>>, tensor_meta: Option<TensorMeta>) -> Self {
        let placements = vec![Placement::Replicate; mesh.ndim()];
        Self {
            mesh,
            placements,
            tensor_meta,
        }
    }

    /// Constructs a spec from a dim map and the mesh dimensions pending a sum.
    ///
    /// Every mesh dimension starts replicated, the dimensions in `sums` become
    /// `Partial(Sum)`, then every tensor dimension `i` with `dim_map[i] == Some(m)` makes mesh
    /// dimension `m` a `Shard(i)`.
    ///
    /// # Arguments
    /// * `dim_map` - For each tensor dimension, the mesh dimension sharding it, if any.
    /// * `sums` - Mesh dimensions with a pending sum.
    pub fn from_dim_map(
        mesh: Arc<DeviceMesh<T>>,
        dim_map: &[Option<usize>],
        sums: &[usize],
        tensor_meta: Option<TensorMeta>,
    ) -> Result<Self, ShardingError> {
        let ndim = mesh.ndim();
        let check_mesh_dim = |mesh_dim: usize| {
            if mesh_dim >= ndim {
                return Err(ShardingError::MeshDimOutOfRange { mesh_dim, ndim });
            }
            Ok(mesh_dim)
        };

        let mut placements = vec![Placement::Replicate; ndim];
        for &mesh_dim in sums {
            placements[check_mesh_dim(mesh_dim)?] = Placement::partial();
        }

        for (tensor_dim, mesh_dim) in dim_map.iter().enumerate() {
            let Some(mesh_dim) = *mesh_dim else {
                continue;
            };
            let mesh_dim = check_mesh_dim(mesh_dim)?;
            match placements[mesh_dim] {
                Placement::Shard(first) => {
                    return Err(ShardingError::MeshDimAlreadySharded {
                        mesh_dim,
                        first,
                        second: tensor_dim,
                    });
                }
                Placement::Partial(_) => {
                    return Err(ShardingError::ShardPartialConflict { mesh_dim });
                }
                Placement::Replicate => placements[mesh_dim] = Placement::Shard(tensor_dim),
            }
        }

        Ok(Self {
            mesh,
            placements,
            tensor_meta,
        })
    }

    /// Device mesh the tensor is distributed over.
    pub fn mesh(&self) -> &Arc<DeviceMesh<T>> {
        &self.mesh
    }

    /// Placement on each mesh dimension.
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Global tensor metadata, if known.
    pub fn tensor_meta(&self) -> Option<&TensorMeta> {
        self.tensor_meta.as_ref()
    }

    /// Global shape of the tensor.
    pub fn shape(&self) -> Result<&[usize], ShardingError> {
        self.tensor_meta
            .as_ref()
            .map(TensorMeta::shape)
            .ok_or(ShardingError::MissingTensorMeta)
    }

    /// Rank of the tensor.
    pub fn ndim(&self) -> Result<usize, ShardingError> {
        self.shape().map(<[usize]>::len)
    }

    /// Returns a spec with the placement of `mesh_dim` replaced by `placement`.
    pub fn with_placement(
        &self,
        mesh_dim: usize,
        placement: Placement,
    ) -> Result<Self, ShardingError> {
        if mesh_dim >= self.placements.len() {
            return Err(ShardingError::MeshDimOutOfRange {
                mesh_dim,
                ndim: self.placements.len(),
            });
        }
        let mut spec = self.clone();
        spec.placements[mesh_dim] = placement;
        Ok(spec)
    }

    /// Returns a spec with the given tensor metadata.
    pub fn with_tensor_meta(&self, tensor_meta: Option<TensorMeta>) -> Self {
        let mut spec = self.clone();
        spec.tensor_meta = tensor_meta;
        spec
    }

    /// Maps every tensor dimension to the mesh dimension sharding it.
    ///
    /// `dim_map[i] == None` means tensor dimension `i` is replicated on every mesh dimension,
    /// `dim_map[i] == Some(j)` means it is sharded on mesh dimension `j`. For a tensor of shape
    /// `[18, 20, 30]` on a 1-d mesh with placements `[Shard(1)]`, the dim map is
    /// `[None, Some(0), None]`.
    ///
    /// Fails if a tensor dimension is sharded on more than one mesh dimension.
    pub fn dim_map(&self) -> Result<Vec<Option<usize>>, ShardingError> {
        let ndim = self.ndim()?;
        let mut dim_map = vec![None; ndim];
        for (mesh_dim, placement) in self.placements.iter().enumerate() {
            let Placement::Shard(tensor_dim) = *placement else {
                continue;
            };
            if tensor_dim >= ndim {
                return Err(ShardingError::ShardDimOutOfRange {
                    dim: tensor_dim,
                    ndim,
                });
            }
            if let Some(claimed) = dim_map[tensor_dim] {
                return Err(ShardingError::HybridSharding {
                    tensor_dim,
                    mesh_dim: claimed,
                });
            }
            dim_map[tensor_dim] = Some(mesh_dim);
        }
        Ok(dim_map)
    }

    /// Mesh dimensions with a pending reduction, in ascending order.
    pub fn sums(&self) -> Vec<usize> {
        self.placements
            .iter()
            .enumerate()
            .filter(|(_, placement)| placement.is_partial())
            .map(|(mesh_dim, _)| mesh_dim)
            .collect()
    }

    /// Shape of the local shard held by the calling rank.
    pub fn local_shape(&self) -> Result<Vec<usize>, ShardingError> {
        self.local_geometry().map(|(shape, _)| shape)
    }

    /// Offsets of the local shard held by the calling rank within the global tensor.
    ///
    /// Together with [`local_shape`](Self::local_shape), this tells exactly which slice of the
    /// logical tensor the rank holds, e.g. for checkpointing.
    pub fn local_offsets(&self) -> Result<Vec<usize>, ShardingError> {
        self.local_geometry().map(|(_, offsets)| offsets)
    }

    fn local_geometry(&self) -> Result<(Vec<usize>, Vec<usize>), ShardingError> {
        let mut shape = self.shape()?.to_vec();
        self.dim_map()?;
        let coordinate = self.mesh.coordinate().ok_or(ShardingError::NotInMesh)?;

        let mut offsets = vec![0; shape.len()];
        for (mesh_dim, placement) in self.placements.iter().enumerate() {
            if let Placement::Shard(dim) = *placement {
                let (size, offset) = local_shard_size_on_dim(
                    shape[dim],
                    self.mesh.size(mesh_dim),
                    coordinate[mesh_dim],
                )
                .map_err(|err| match err {
                    ShardingError::ChunkCountExceedsDim {
                        size, num_chunks, ..
                    } => ShardingError::ChunkCountExceedsDim {
                        dim,
                        size,
                        num_chunks,
                    },
                    err => err,
                })?;
                shape[dim] = size;
                offsets[dim] = offset;
            }
        }
        Ok((shape, offsets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::ReduceOperation;
    use crate::sharding::{DeviceMeshBuilder, MeshDim};
    use core::hash::BuildHasher;
    use hashbrown::DefaultHashBuilder;

    fn mesh(shape: &[usize], local_rank: Option<usize>) -> Arc<DeviceMesh<usize>> {
        let devices = (0..shape.iter().product::<usize>()).collect();
        let mut builder = DeviceMeshBuilder::new(devices, shape.to_vec());
        for (idx, name) in ["x", "y", "z"].iter().take(shape.len()).enumerate() {
            builder = builder.with_dim(idx, MeshDim::new(*name));
        }
        if let Some(rank) = local_rank {
            builder = builder.with_local_rank(rank);
        }
        Arc::new(builder.build().unwrap())
    }

    fn spec(
        mesh: &Arc<DeviceMesh<usize>>,
        placements: Vec<Placement>,
        shape: &[usize],
    ) -> DistributionSpec<usize> {
        DistributionSpec::new(mesh.clone(), placements, Some(TensorMeta::new(shape))).unwrap()
    }

    #[test]
    fn test_spec_should_match_mesh_ndim() {
        let mesh = mesh(&[2, 2], None);
        let result = DistributionSpec::new(mesh, vec![Placement::Replicate], None);

        assert_eq!(
            result.unwrap_err(),
            ShardingError::PlacementCountMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_dim_map_and_sums() {
        let mesh = mesh(&[4], None);
        let spec = spec(&mesh, vec![Placement::Shard(1)], &[18, 20, 30]);
        assert_eq!(spec.dim_map().unwrap(), vec![None, Some(0), None]);
        assert!(spec.sums().is_empty());

        let mesh = mesh_2d();
        let spec = spec_2d(&mesh, vec![Placement::partial(), Placement::Shard(0)]);
        assert_eq!(spec.dim_map().unwrap(), vec![Some(1), None]);
        assert_eq!(spec.sums(), vec![0]);
    }

    fn mesh_2d() -> Arc<DeviceMesh<usize>> {
        mesh(&[2, 3], None)
    }

    fn spec_2d(mesh: &Arc<DeviceMesh<usize>>, placements: Vec<Placement>) -> DistributionSpec<usize> {
        spec(mesh, placements, &[12, 8])
    }

    #[test]
    fn test_dim_map_should_reject_hybrid_sharding() {
        let mesh = mesh_2d();
        let spec = spec_2d(&mesh, vec![Placement::Shard(0), Placement::Shard(0)]);

        assert_eq!(
            spec.dim_map().unwrap_err(),
            ShardingError::HybridSharding {
                tensor_dim: 0,
                mesh_dim: 0
            }
        );
    }

    #[test]
    fn test_dim_map_should_reject_out_of_range_shard() {
        let mesh = mesh(&[2], None);
        let spec = spec(&mesh, vec![Placement::Shard(2)], &[4, 4]);

        assert_eq!(
            spec.dim_map().unwrap_err(),
            ShardingError::ShardDimOutOfRange { dim: 2, ndim: 2 }
        );
    }

    #[test]
    fn test_dim_map_requires_tensor_meta() {
        let mesh = mesh(&[2], None);
        let spec = DistributionSpec::new(mesh, vec![Placement::Shard(0)], None).unwrap();

        assert_eq!(spec.dim_map().unwrap_err(), ShardingError::MissingTensorMeta);
        assert_eq!(spec.shape().unwrap_err(), ShardingError::MissingTensorMeta);
        assert_eq!(spec.local_shape().unwrap_err(), ShardingError::MissingTensorMeta);
        assert_eq!(spec.local_offsets().unwrap_err(), ShardingError::MissingTensorMeta);
    }

    #[test]
    fn test_from_dim_map_round_trip() {
        let mesh = mesh_2d();
        let all_placements = [
            vec![Placement::Replicate, Placement::Replicate],
            vec![Placement::Shard(0), Placement::Replicate],
            vec![Placement::Shard(1), Placement::Shard(0)],
            vec![Placement::partial(), Placement::Shard(1)],
            vec![Placement::partial(), Placement::partial()],
        ];

        for placements in all_placements {
            let spec = spec_2d(&mesh, placements);
            let rebuilt = DistributionSpec::from_dim_map(
                mesh.clone(),
                &spec.dim_map().unwrap(),
                &spec.sums(),
                spec.tensor_meta().cloned(),
            )
            .unwrap();

            assert_eq!(rebuilt, spec);
        }
    }

    #[test]
    fn test_from_dim_map_loses_reduce_op() {
        let mesh = mesh(&[2], None);
        let spec = spec(&mesh, vec![Placement::Partial(ReduceOperation::Max)], &[4]);
        let rebuilt =
            DistributionSpec::from_dim_map(mesh.clone(), &spec.dim_map().unwrap(), &spec.sums(), None)
                .unwrap();

        assert_eq!(rebuilt.placements(), &[Placement::Partial(ReduceOperation::Sum)]);
    }

    #[test]
    fn test_from_dim_map_should_reject_conflicts() {
        let mesh = mesh_2d();

        assert_eq!(
            DistributionSpec::from_dim_map(mesh.clone(), &[Some(0), Some(0)], &[], None)
                .unwrap_err(),
            ShardingError::MeshDimAlreadySharded {
                mesh_dim: 0,
                first: 0,
                second: 1
            }
        );
        assert_eq!(
            DistributionSpec::from_dim_map(mesh.clone(), &[None, Some(1)], &[1], None)
                .unwrap_err(),
            ShardingError::ShardPartialConflict { mesh_dim: 1 }
        );
        assert_eq!(
            DistributionSpec::from_dim_map(mesh.clone(), &[Some(2)], &[], None).unwrap_err(),
            ShardingError::MeshDimOutOfRange {
                mesh_dim: 2,
                ndim: 2
            }
        );
    }

    #[test]
    fn test_uneven_local_shape_and_offsets() {
        let expected = [(3, 0), (3, 3), (2, 6), (2, 8)];

        for (rank, (size, offset)) in expected.into_iter().enumerate() {
            let mesh = mesh(&[4], Some(rank));
            let spec = spec(&mesh, vec![Placement::Shard(0)], &[10]);

            assert_eq!(spec.local_shape().unwrap(), vec![size]);
            assert_eq!(spec.local_offsets().unwrap(), vec![offset]);
        }
    }

    #[test]
    fn test_local_shape_on_2d_mesh() {
        // Rank 4 sits at coordinate [1, 1] of the 2x3 mesh.
        let mesh = mesh(&[2, 3], Some(4));
        let spec = spec(
            &mesh,
            vec![Placement::Shard(1), Placement::Shard(0)],
            &[10, 7],
        );

        assert_eq!(spec.local_shape().unwrap(), vec![3, 3]);
        assert_eq!(spec.local_offsets().unwrap(), vec![4, 4]);

        let spec = spec.with_placement(0, Placement::partial()).unwrap();
        assert_eq!(spec.local_shape().unwrap(), vec![3, 7]);
        assert_eq!(spec.local_offsets().unwrap(), vec![4, 0]);
    }

    #[test]
    fn test_local_shape_conservation() {
        let global = [13, 5];
        for num_chunks in 1..=5 {
            let total: usize = (0..num_chunks)
                .map(|rank| {
                    let mesh = mesh(&[num_chunks], Some(rank));
                    spec(&mesh, vec![Placement::Shard(0)], &global)
                        .local_shape()
                        .unwrap()[0]
                })
                .sum();

            assert_eq!(total, global[0]);
        }
    }

    #[test]
    fn test_local_shape_outside_mesh() {
        let mesh = mesh(&[2], None);
        let spec = spec(&mesh, vec![Placement::Shard(0)], &[4]);

        assert_eq!(spec.local_shape().unwrap_err(), ShardingError::NotInMesh);
        assert_eq!(spec.local_offsets().unwrap_err(), ShardingError::NotInMesh);
    }

    #[test]
    fn test_local_shape_should_reject_small_dims() {
        let mesh = mesh(&[4], Some(0));
        let spec = spec(&mesh, vec![Placement::Shard(1)], &[8, 3]);

        assert_eq!(
            spec.local_shape().unwrap_err(),
            ShardingError::ChunkCountExceedsDim {
                dim: 1,
                size: 3,
                num_chunks: 4
            }
        );
    }

    #[test]
    fn test_spec_equality_and_hash_are_structural() {
        let state = DefaultHashBuilder::default();
        let lhs = spec(&mesh(&[2, 3], Some(0)), vec![Placement::Shard(0), Placement::Replicate], &[6, 6]);
        let rhs = spec(&mesh(&[2, 3], Some(5)), vec![Placement::Shard(0), Placement::Replicate], &[6, 6]);

        assert_eq!(lhs, rhs);
        assert_eq!(state.hash_one(&lhs), state.hash_one(&rhs));

        let other_shape = lhs.with_tensor_meta(Some(TensorMeta::new([6, 7])));
        assert_ne!(lhs, other_shape);

        let other_placements = lhs.with_placement(1, Placement::partial()).unwrap();
        assert_ne!(lhs, other_placements);
    }
}

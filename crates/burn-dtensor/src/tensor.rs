use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ndarray::ArrayD;

use crate::collective::{Collective, Element};
use crate::redistribute::{RedistributeConfig, RedistributeError, Redistributor};
use crate::sharding::{DeviceMesh, DistributionSpec, Placement, ShardingError, TensorMeta};

/// Represents a tensor that is distributed (sharded, replicated or partial) across devices.
///
/// A `DistributedTensor` contains the local buffer of one rank along with the
/// [`DistributionSpec`] describing how the full tensor is laid out over the device mesh. The
/// buffer and its spec always travel together: every redistribution returns a new tensor with
/// a new spec.
#[derive(Debug)]
pub struct DistributedTensor<E, T> {
    /// Local shard of the tensor
    local: ArrayD<E>,
    /// Specification of how this tensor is distributed
    spec: DistributionSpec<T>,
}

impl<E: Clone, T> Clone for DistributedTensor<E, T> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            spec: self.spec.clone(),
        }
    }
}

impl<E: Element, T> DistributedTensor<E, T> {
    /// Pairs a local buffer with its spec.
    ///
    /// When the calling rank is part of the mesh and the spec knows the global shape, the
    /// buffer must have the local shape implied by the spec.
    pub fn from_local(local: ArrayD<E>, spec: DistributionSpec<T>) -> Result<Self, ShardingError> {
        if spec.mesh().coordinate().is_some() && spec.tensor_meta().is_some() {
            let expected = spec.local_shape()?;
            if expected.len() != local.ndim() {
                return Err(ShardingError::Layout {
                    message: format!(
                        "local tensor has {} dims, the spec expects {}",
                        local.ndim(),
                        expected.len()
                    ),
                });
            }
            if let Some((dim, (&expected, &actual))) = expected
                .iter()
                .zip(local.shape())
                .enumerate()
                .find(|(_, (expected, actual))| expected != actual)
            {
                return Err(ShardingError::LocalSizeMismatch {
                    dim,
                    expected,
                    actual,
                });
            }
        }
        Ok(Self { local, spec })
    }

    /// Distributes a full tensor, held identically by every rank, over `mesh`.
    ///
    /// Mesh dimensions are processed in order: a `Shard` placement scatters the chunks of
    /// coordinate `0`, a `Replicate` placement broadcasts coordinate `0`'s tensor. `Partial`
    /// placements cannot be produced from a full tensor.
    pub fn distribute<C: Collective<E>>(
        tensor: &ArrayD<E>,
        mesh: Arc<DeviceMesh<T>>,
        placements: Vec<Placement>,
        comm: &C,
        config: &RedistributeConfig,
    ) -> Result<Self, RedistributeError> {
        let spec = DistributionSpec::new(
            mesh.clone(),
            placements,
            Some(TensorMeta::new(tensor.shape())),
        )?;
        spec.dim_map()?;
        if let Some((mesh_dim, &to)) = spec
            .placements()
            .iter()
            .enumerate()
            .find(|(_, placement)| placement.is_partial())
        {
            return Err(RedistributeError::UnsupportedTransition {
                from: Placement::Replicate,
                to,
                mesh_dim,
            });
        }

        let redistributor = Redistributor::new(&mesh, comm).with_config(config.clone());
        let mut local = tensor.clone();
        for (mesh_dim, placement) in spec.placements().iter().enumerate() {
            local = match *placement {
                Placement::Shard(dim) => redistributor.shard_tensor(&local, dim, mesh_dim)?,
                _ => redistributor.replicate_tensor(&local, mesh_dim)?,
            };
        }

        Ok(Self { local, spec })
    }

    /// Local buffer of the calling rank.
    pub fn local(&self) -> &ArrayD<E> {
        &self.local
    }

    /// Consumes the tensor, returning the local buffer.
    pub fn into_local(self) -> ArrayD<E> {
        self.local
    }

    /// Distribution spec of the tensor.
    pub fn spec(&self) -> &DistributionSpec<T> {
        &self.spec
    }

    /// Placement on each mesh dimension.
    pub fn placements(&self) -> &[Placement] {
        self.spec.placements()
    }

    /// Global shape of the tensor.
    pub fn global_shape(&self) -> Result<&[usize], ShardingError> {
        self.spec.shape()
    }

    /// Moves the tensor to `target` on a single mesh dimension.
    ///
    /// The new spec is validated before any data moves.
    pub fn redistribute_dim<C: Collective<E>>(
        &self,
        mesh_dim: usize,
        target: Placement,
        comm: &C,
        config: &RedistributeConfig,
    ) -> Result<Self, RedistributeError> {
        let spec = self.spec.with_placement(mesh_dim, target)?;
        spec.dim_map()?;
        let global_shape = self.spec.shape()?;

        let redistributor = Redistributor::new(self.spec.mesh(), comm).with_config(config.clone());
        let local = redistributor.transition(
            &self.local,
            global_shape,
            self.spec.placements()[mesh_dim],
            target,
            mesh_dim,
        )?;

        Ok(Self { local, spec })
    }

    /// Moves the tensor to `placements`, one single-dimension transition at a time.
    ///
    /// The target placements are validated up front. Sharded and partial mesh dimensions that
    /// must become replicated are resolved first, then the remaining dimensions are sharded. A
    /// shard moving to another tensor dimension goes through `Replicate`.
    pub fn redistribute<C: Collective<E>>(
        &self,
        placements: &[Placement],
        comm: &C,
        config: &RedistributeConfig,
    ) -> Result<Self, RedistributeError> {
        DistributionSpec::new(
            self.spec.mesh().clone(),
            placements.to_vec(),
            self.spec.tensor_meta().cloned(),
        )?
        .dim_map()?;
        for (mesh_dim, (&from, &to)) in self.placements().iter().zip(placements).enumerate() {
            if to.is_partial() && from != to {
                return Err(RedistributeError::UnsupportedTransition { from, to, mesh_dim });
            }
        }

        let mut tensor = self.clone();
        for (mesh_dim, &target) in placements.iter().enumerate() {
            let current = tensor.placements()[mesh_dim];
            let to_replicate = match (current, target) {
                (current, target) if current == target => false,
                (Placement::Shard(_), _) => true,
                (Placement::Partial(_), Placement::Replicate) => true,
                _ => false,
            };
            if to_replicate {
                tensor = tensor.redistribute_dim(mesh_dim, Placement::Replicate, comm, config)?;
            }
        }
        for (mesh_dim, &target) in placements.iter().enumerate() {
            if tensor.placements()[mesh_dim] != target {
                tensor = tensor.redistribute_dim(mesh_dim, target, comm, config)?;
            }
        }

        log::trace!("Redistributed tensor to {:?}", placements);
        Ok(tensor)
    }

    /// Returns the full tensor, replicated on every rank of the mesh.
    pub fn full_tensor<C: Collective<E>>(
        &self,
        comm: &C,
        config: &RedistributeConfig,
    ) -> Result<ArrayD<E>, RedistributeError> {
        let placements: Vec<Placement> = self
            .spec
            .placements()
            .iter()
            .map(|_| Placement::Replicate)
            .collect();
        self.redistribute(&placements, comm, config)
            .map(DistributedTensor::into_local)
    }
}

use alloc::vec::Vec;

use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collective::{Collective, CollectiveError, Element, ReduceOperation};
use crate::sharding::split::{
    concat_tensors, is_padded, local_shard_size_on_dim, pad_tensor, split_size, split_tensor,
    unpad_tensor,
};
use crate::sharding::{DeviceMesh, Placement, ShardingError};

/// When chunks are padded to a uniform size before entering a collective.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Padding {
    /// Pad only when the collective backend requires uniform buffers.
    #[default]
    Auto,
    /// Always pad short chunks.
    Always,
    /// Never pad; the backend must support uneven collectives.
    Never,
}

/// Configuration of the resharding protocols.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedistributeConfig {
    /// Padding strategy for uneven chunks.
    #[serde(default)]
    pub padding: Padding,
}

impl RedistributeConfig {
    /// Sets the padding strategy.
    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Whether chunks exchanged through `comm` are padded.
    pub fn pads<E: Element, C: Collective<E>>(&self, comm: &C) -> bool {
        match self.padding {
            Padding::Auto => comm.requires_uniform_buffers(),
            Padding::Always => true,
            Padding::Never => false,
        }
    }
}

/// Errors raised while moving a tensor between placements.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum RedistributeError {
    /// The request violates the layout contract.
    #[error(transparent)]
    Sharding(#[from] ShardingError),
    /// The collective backend failed.
    #[error(transparent)]
    Collective(#[from] CollectiveError),
    /// No protocol moves a tensor between the two placements.
    #[error("cannot redistribute from {from} to {to} on mesh dim {mesh_dim}")]
    UnsupportedTransition {
        /// Current placement.
        from: Placement,
        /// Requested placement.
        to: Placement,
        /// Mesh dimension of the transition.
        mesh_dim: usize,
    },
}

/// Runs the resharding protocols of one rank over a mesh and a collective backend.
///
/// Every protocol is collective: all ranks of the group along the mesh dimension must call the
/// same protocol with the same arguments, in the same order. A rank that is not part of the mesh
/// never enters a collective and gets an empty placeholder tensor of shape `[0]` back.
pub struct Redistributor<'a, T, C> {
    mesh: &'a DeviceMesh<T>,
    comm: &'a C,
    config: RedistributeConfig,
}

impl<'a, T, C> Redistributor<'a, T, C> {
    /// Creates a redistributor with the default configuration.
    pub fn new(mesh: &'a DeviceMesh<T>, comm: &'a C) -> Self {
        Self {
            mesh,
            comm,
            config: RedistributeConfig::default(),
        }
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: RedistributeConfig) -> Self {
        self.config = config;
        self
    }

    /// Mesh the protocols run on.
    pub fn mesh(&self) -> &'a DeviceMesh<T> {
        self.mesh
    }

    /// Collective backend the protocols run on.
    pub fn comm(&self) -> &'a C {
        self.comm
    }

    /// Current configuration.
    pub fn config(&self) -> &RedistributeConfig {
        &self.config
    }

    /// Shards a replicated tensor on `shard_dim` across `mesh_dim` (`Replicate -> Shard`).
    ///
    /// Coordinate `0` on `mesh_dim` is the source of truth: its chunks are scattered to the
    /// other ranks of the group.
    pub fn shard_tensor<E>(
        &self,
        tensor: &ArrayD<E>,
        shard_dim: usize,
        mesh_dim: usize,
    ) -> Result<ArrayD<E>, RedistributeError>
    where
        E: Element,
        C: Collective<E>,
    {
        let Some(position) = self.position(mesh_dim)? else {
            return Ok(placeholder("shard", mesh_dim));
        };
        let num_chunks = self.mesh.size(mesh_dim);
        let padding = self.config.pads::<E, C>(self.comm);

        let (chunks, pad_idx) = split_tensor(tensor, shard_dim, num_chunks, padding)?;
        log::debug!(
            "Scattering tensor dim {shard_dim} into {num_chunks} chunks on mesh dim {mesh_dim} (pad_idx={pad_idx}, padding={padding})"
        );

        let mut output = ArrayD::zeros(chunks[position].raw_dim());
        self.comm.scatter(&mut output, &chunks, mesh_dim)?;

        if padding && is_padded(pad_idx, position) {
            output = unpad_tensor(&output, shard_dim)?;
        }
        Ok(output)
    }

    /// Broadcasts the tensor of coordinate `0` on `mesh_dim` to the rest of the group.
    pub fn replicate_tensor<E>(
        &self,
        tensor: &ArrayD<E>,
        mesh_dim: usize,
    ) -> Result<ArrayD<E>, RedistributeError>
    where
        E: Element,
        C: Collective<E>,
    {
        if self.position(mesh_dim)?.is_none() {
            return Ok(placeholder("replicate", mesh_dim));
        }
        log::debug!("Broadcasting tensor on mesh dim {mesh_dim}");

        let mut output = tensor.as_standard_layout().into_owned();
        self.comm.broadcast(&mut output, mesh_dim)?;
        Ok(output)
    }

    /// Reduces partial contributions with `op` and shards the result on `shard_dim` across
    /// `mesh_dim`, in one reduce-scatter.
    pub fn reduce_shard_tensor<E>(
        &self,
        tensor: &ArrayD<E>,
        shard_dim: usize,
        op: ReduceOperation,
        mesh_dim: usize,
    ) -> Result<ArrayD<E>, RedistributeError>
    where
        E: Element,
        C: Collective<E>,
    {
        let Some(position) = self.position(mesh_dim)? else {
            return Ok(placeholder("reduce_shard", mesh_dim));
        };
        let num_chunks = self.mesh.size(mesh_dim);
        let padding = self.config.pads::<E, C>(self.comm);

        let (chunks, pad_idx) = split_tensor(tensor, shard_dim, num_chunks, padding)?;
        log::debug!(
            "Reduce-scattering tensor dim {shard_dim} with {op:?} into {num_chunks} chunks on mesh dim {mesh_dim} (pad_idx={pad_idx}, padding={padding})"
        );

        let mut output = ArrayD::zeros(chunks[position].raw_dim());
        self.comm.reduce_scatter(&mut output, &chunks, op, mesh_dim)?;

        if padding && is_padded(pad_idx, position) {
            output = unpad_tensor(&output, shard_dim)?;
        }
        Ok(output)
    }

    /// Gathers the shards of `shard_dim` across `mesh_dim` into the full tensor
    /// (`Shard -> Replicate`).
    ///
    /// `global_size` is the size of `shard_dim` in the full tensor.
    pub fn to_replicate_tensor<E>(
        &self,
        local: &ArrayD<E>,
        shard_dim: usize,
        global_size: usize,
        mesh_dim: usize,
    ) -> Result<ArrayD<E>, RedistributeError>
    where
        E: Element,
        C: Collective<E>,
    {
        let Some(position) = self.position(mesh_dim)? else {
            return Ok(placeholder("all_gather", mesh_dim));
        };
        if shard_dim >= local.ndim() {
            return Err(ShardingError::ShardDimOutOfRange {
                dim: shard_dim,
                ndim: local.ndim(),
            }
            .into());
        }
        let num_chunks = self.mesh.size(mesh_dim);
        let padding = self.config.pads::<E, C>(self.comm);

        let (_, pad_idx) = split_size(global_size, num_chunks)?;
        let (expected, _) = local_shard_size_on_dim(global_size, num_chunks, position)?;
        let actual = local.len_of(Axis(shard_dim));
        if actual != expected {
            return Err(ShardingError::LocalSizeMismatch {
                dim: shard_dim,
                expected,
                actual,
            }
            .into());
        }
        log::debug!(
            "Gathering {num_chunks} shards of tensor dim {shard_dim} on mesh dim {mesh_dim} (pad_idx={pad_idx}, padding={padding})"
        );

        let input = if padding && is_padded(pad_idx, position) {
            pad_tensor(local, shard_dim)?
        } else {
            local.as_standard_layout().into_owned()
        };

        let mut gathered: Vec<ArrayD<E>> = (0..num_chunks)
            .map(|index| -> Result<ArrayD<E>, ShardingError> {
                let mut shape = input.shape().to_vec();
                if !padding {
                    shape[shard_dim] = local_shard_size_on_dim(global_size, num_chunks, index)
                        .map(|(size, _)| size)?;
                }
                Ok(ArrayD::zeros(IxDyn(&shape)))
            })
            .collect::<Result<_, ShardingError>>()?;
        self.comm.all_gather(&mut gathered, &input, mesh_dim)?;

        if padding {
            for (index, chunk) in gathered.iter_mut().enumerate() {
                if is_padded(pad_idx, index) {
                    *chunk = unpad_tensor(chunk, shard_dim)?;
                }
            }
        }
        Ok(concat_tensors(&gathered, shard_dim)?)
    }

    /// Reduces partial contributions with `op` into a replicated tensor (`Partial -> Replicate`).
    pub fn partial_to_replicate<E>(
        &self,
        tensor: &ArrayD<E>,
        op: ReduceOperation,
        mesh_dim: usize,
    ) -> Result<ArrayD<E>, RedistributeError>
    where
        E: Element,
        C: Collective<E>,
    {
        if self.position(mesh_dim)?.is_none() {
            return Ok(placeholder("all_reduce", mesh_dim));
        }
        log::debug!("All-reducing tensor with {op:?} on mesh dim {mesh_dim}");

        let mut output = tensor.as_standard_layout().into_owned();
        self.comm.all_reduce(&mut output, op, mesh_dim)?;
        Ok(output)
    }

    /// Reduces partial contributions with `op` into a tensor sharded on `shard_dim`
    /// (`Partial -> Shard`).
    pub fn partial_to_shard<E>(
        &self,
        tensor: &ArrayD<E>,
        op: ReduceOperation,
        shard_dim: usize,
        mesh_dim: usize,
    ) -> Result<ArrayD<E>, RedistributeError>
    where
        E: Element,
        C: Collective<E>,
    {
        self.reduce_shard_tensor(tensor, shard_dim, op, mesh_dim)
    }

    /// Moves `local` from placement `from` to placement `to` on `mesh_dim`.
    ///
    /// `global_shape` is the shape of the full tensor. Only the five single-dimension edges are
    /// supported; an identical placement is a no-op.
    pub fn transition<E>(
        &self,
        local: &ArrayD<E>,
        global_shape: &[usize],
        from: Placement,
        to: Placement,
        mesh_dim: usize,
    ) -> Result<ArrayD<E>, RedistributeError>
    where
        E: Element,
        C: Collective<E>,
    {
        match (from, to) {
            (from, to) if from == to => Ok(local.clone()),
            (Placement::Shard(dim), Placement::Replicate) => {
                let global_size = global_shape.get(dim).copied().ok_or(
                    ShardingError::ShardDimOutOfRange {
                        dim,
                        ndim: global_shape.len(),
                    },
                )?;
                self.to_replicate_tensor(local, dim, global_size, mesh_dim)
            }
            (Placement::Replicate, Placement::Shard(dim)) => {
                self.shard_tensor(local, dim, mesh_dim)
            }
            (Placement::Partial(op), Placement::Replicate) => {
                self.partial_to_replicate(local, op, mesh_dim)
            }
            (Placement::Partial(op), Placement::Shard(dim)) => {
                self.partial_to_shard(local, op, dim, mesh_dim)
            }
            (from, to) => Err(RedistributeError::UnsupportedTransition { from, to, mesh_dim }),
        }
    }

    /// Position of the calling rank in its group along `mesh_dim`, `None` outside the mesh.
    fn position(&self, mesh_dim: usize) -> Result<Option<usize>, ShardingError> {
        if mesh_dim >= self.mesh.ndim() {
            return Err(ShardingError::MeshDimOutOfRange {
                mesh_dim,
                ndim: self.mesh.ndim(),
            });
        }
        Ok(self
            .mesh
            .coordinate()
            .map(|coordinate| coordinate[mesh_dim]))
    }
}

/// Empty tensor returned to ranks that are not part of the mesh.
fn placeholder<E: Element>(protocol: &str, mesh_dim: usize) -> ArrayD<E> {
    log::trace!("Rank is not part of the mesh, skipping {protocol} on mesh dim {mesh_dim}");
    ArrayD::zeros(IxDyn(&[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{DeviceMeshBuilder, MeshDim};
    use alloc::string::ToString;
    use ndarray::array;

    /// Backend that fails every collective, to observe which protocols reach it.
    struct Unreachable;

    impl Collective<f32> for Unreachable {
        fn scatter(
            &self,
            _output: &mut ArrayD<f32>,
            _chunks: &[ArrayD<f32>],
            _mesh_dim: usize,
        ) -> Result<(), CollectiveError> {
            Err(unreachable())
        }

        fn all_gather(
            &self,
            _outputs: &mut [ArrayD<f32>],
            _input: &ArrayD<f32>,
            _mesh_dim: usize,
        ) -> Result<(), CollectiveError> {
            Err(unreachable())
        }

        fn reduce_scatter(
            &self,
            _output: &mut ArrayD<f32>,
            _chunks: &[ArrayD<f32>],
            _op: ReduceOperation,
            _mesh_dim: usize,
        ) -> Result<(), CollectiveError> {
            Err(unreachable())
        }

        fn broadcast(
            &self,
            _buffer: &mut ArrayD<f32>,
            _mesh_dim: usize,
        ) -> Result<(), CollectiveError> {
            Err(unreachable())
        }

        fn all_reduce(
            &self,
            _buffer: &mut ArrayD<f32>,
            _op: ReduceOperation,
            _mesh_dim: usize,
        ) -> Result<(), CollectiveError> {
            Err(unreachable())
        }
    }

    fn unreachable() -> CollectiveError {
        CollectiveError::Transport {
            message: "collective entered".to_string(),
        }
    }

    fn mesh(local_rank: Option<usize>) -> DeviceMesh<usize> {
        let builder = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [4]).with_dim(0, MeshDim::new("x"));
        match local_rank {
            Some(rank) => builder.with_local_rank(rank),
            None => builder,
        }
        .build()
        .unwrap()
    }

    #[test]
    fn test_every_protocol_skips_ranks_outside_the_mesh() {
        let mesh = mesh(None);
        let redistributor = Redistributor::new(&mesh, &Unreachable);
        let tensor = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]].into_dyn();
        let empty = ArrayD::<f32>::zeros(IxDyn(&[0]));

        assert_eq!(redistributor.shard_tensor(&tensor, 0, 0).unwrap(), empty);
        assert_eq!(redistributor.replicate_tensor(&tensor, 0).unwrap(), empty);
        assert_eq!(
            redistributor
                .reduce_shard_tensor(&tensor, 0, ReduceOperation::Sum, 0)
                .unwrap(),
            empty
        );
        assert_eq!(
            redistributor
                .to_replicate_tensor(&tensor, 0, 16, 0)
                .unwrap(),
            empty
        );
        assert_eq!(
            redistributor
                .partial_to_replicate(&tensor, ReduceOperation::Sum, 0)
                .unwrap(),
            empty
        );
        assert_eq!(
            redistributor
                .partial_to_shard(&tensor, ReduceOperation::Sum, 1, 0)
                .unwrap(),
            empty
        );
    }

    #[test]
    fn test_validation_happens_before_collectives() {
        let mesh = mesh(Some(1));
        let redistributor = Redistributor::new(&mesh, &Unreachable);
        let tensor = array![1.0f32, 2.0, 3.0].into_dyn();

        assert_eq!(
            redistributor.shard_tensor(&tensor, 0, 0),
            Err(RedistributeError::Sharding(ShardingError::ChunkCountExceedsDim {
                dim: 0,
                size: 3,
                num_chunks: 4
            }))
        );
        assert_eq!(
            redistributor.shard_tensor(&tensor, 1, 0),
            Err(RedistributeError::Sharding(ShardingError::ShardDimOutOfRange {
                dim: 1,
                ndim: 1
            }))
        );
        assert_eq!(
            redistributor.replicate_tensor(&tensor, 1),
            Err(RedistributeError::Sharding(ShardingError::MeshDimOutOfRange {
                mesh_dim: 1,
                ndim: 1
            }))
        );
        assert_eq!(
            redistributor.to_replicate_tensor(&tensor, 0, 8, 0),
            Err(RedistributeError::Sharding(ShardingError::LocalSizeMismatch {
                dim: 0,
                expected: 2,
                actual: 3
            }))
        );
        // A well-formed request reaches the backend.
        assert_eq!(
            redistributor.to_replicate_tensor(&tensor, 0, 12, 0),
            Err(RedistributeError::Collective(unreachable()))
        );
    }

    #[test]
    fn test_unsupported_transitions() {
        let mesh = mesh(Some(0));
        let redistributor = Redistributor::new(&mesh, &Unreachable);
        let tensor = array![1.0f32, 2.0, 3.0, 4.0].into_dyn();

        assert_eq!(
            redistributor.transition(&tensor, &[4], Placement::Replicate, Placement::partial(), 0),
            Err(RedistributeError::UnsupportedTransition {
                from: Placement::Replicate,
                to: Placement::partial(),
                mesh_dim: 0,
            })
        );
        assert_eq!(
            redistributor.transition(&tensor, &[4, 4], Placement::Shard(0), Placement::Shard(1), 0),
            Err(RedistributeError::UnsupportedTransition {
                from: Placement::Shard(0),
                to: Placement::Shard(1),
                mesh_dim: 0,
            })
        );
        assert_eq!(
            redistributor
                .transition(&tensor, &[4], Placement::Shard(0), Placement::Shard(0), 0)
                .unwrap(),
            tensor
        );
    }

    #[test]
    fn test_padding_strategy() {
        struct Uneven;

        impl Collective<f32> for Uneven {
            fn scatter(
                &self,
                _output: &mut ArrayD<f32>,
                _chunks: &[ArrayD<f32>],
                _mesh_dim: usize,
            ) -> Result<(), CollectiveError> {
                Ok(())
            }

            fn all_gather(
                &self,
                _outputs: &mut [ArrayD<f32>],
                _input: &ArrayD<f32>,
                _mesh_dim: usize,
            ) -> Result<(), CollectiveError> {
                Ok(())
            }

            fn reduce_scatter(
                &self,
                _output: &mut ArrayD<f32>,
                _chunks: &[ArrayD<f32>],
                _op: ReduceOperation,
                _mesh_dim: usize,
            ) -> Result<(), CollectiveError> {
                Ok(())
            }

            fn broadcast(
                &self,
                _buffer: &mut ArrayD<f32>,
                _mesh_dim: usize,
            ) -> Result<(), CollectiveError> {
                Ok(())
            }

            fn all_reduce(
                &self,
                _buffer: &mut ArrayD<f32>,
                _op: ReduceOperation,
                _mesh_dim: usize,
            ) -> Result<(), CollectiveError> {
                Ok(())
            }

            fn requires_uniform_buffers(&self) -> bool {
                false
            }
        }

        let config = RedistributeConfig::default();
        assert!(config.pads::<f32, _>(&Unreachable));
        assert!(!config.pads::<f32, _>(&Uneven));

        let config = config.with_padding(Padding::Always);
        assert!(config.pads::<f32, _>(&Uneven));

        let config = config.with_padding(Padding::Never);
        assert!(!config.pads::<f32, _>(&Unreachable));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: RedistributeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RedistributeConfig::default());

        let config: RedistributeConfig = serde_json::from_str(r#"{"padding":"Never"}"#).unwrap();
        assert_eq!(config.padding, Padding::Never);
    }
}

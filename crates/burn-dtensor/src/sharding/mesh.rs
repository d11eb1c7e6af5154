use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::hash::{Hash, Hasher};
use hashbrown::{HashMap, HashSet};
use thiserror::Error;

/// Represents a logical mesh dimension, identified by a unique name.
///
/// Mesh dimensions are used to define the logical structure of a device mesh.
/// They help organize and partition parallel computation workloads, such as data,
/// tensor, or pipeline parallelism, across the mesh. Each dimension is named
/// to provide unambiguous mapping during sharding operations.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    /// A name that uniquely identifies the mesh dimension.
    name: String,
}

impl MeshDim {
    /// Constructs a new [`MeshDim`] with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// Name of this mesh dimension.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }
}

/// Represents a logical arrangement of devices used for parallel computation.
///
/// A `DeviceMesh` defines a structured, N-dimensional topology over a set of physical devices,
/// where each dimension can be given a unique name (e.g., `"data"`, `"model"`, `"pipeline"`).
/// Devices are laid out in row-major order: the device at position `rank` in the device list
/// sits at the coordinate obtained by unravelling `rank` over the mesh shape.
///
/// A mesh value is held by one process at a time, which may declare its own position in the
/// mesh as the *local rank*. The local rank is what [`coordinate`](DeviceMesh::coordinate)
/// reports; a process that is not part of the mesh has no local rank and no coordinate.
///
/// Equality and hashing only consider the topology (devices, shape and dimension names), so
/// two processes' views of the same mesh compare equal.
#[derive(Clone, Debug)]
pub struct DeviceMesh<T> {
    /// Physical devices in an n-dimensional logical arrangement
    devices: Vec<T>,
    /// Shape of the logical mesh
    shape: Vec<usize>,
    /// Name of each mesh dimension, in index order
    dims: Vec<MeshDim>,
    /// Position of the calling process in `devices`
    local_rank: Option<usize>,
}

impl<T> DeviceMesh<T> {
    /// Number of mesh dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of coordinates along `mesh_dim`.
    ///
    /// # Panics
    ///
    /// Panics if `mesh_dim` is not smaller than [`ndim`](DeviceMesh::ndim).
    pub fn size(&self, mesh_dim: usize) -> usize {
        self.shape[mesh_dim]
    }

    /// Shape of the logical mesh.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Devices of the mesh in row-major order.
    pub fn devices(&self) -> &[T] {
        &self.devices
    }

    /// Total number of devices in the mesh.
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Mesh dimensions, in index order.
    pub fn dims(&self) -> &[MeshDim] {
        &self.dims
    }

    /// Index of the given named dimension, if it belongs to this mesh.
    pub fn dim_index(&self, dim: &MeshDim) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    /// Rank of the calling process, if it is part of the mesh.
    pub fn local_rank(&self) -> Option<usize> {
        self.local_rank
    }

    /// Coordinate of the calling process, one entry per mesh dimension.
    ///
    /// Returns `None` when the calling process is not part of the mesh.
    pub fn coordinate(&self) -> Option<Vec<usize>> {
        self.local_rank.and_then(|rank| self.coordinate_of(rank))
    }

    /// Coordinate of the device at `rank`, or `None` if `rank` is outside the mesh.
    pub fn coordinate_of(&self, rank: usize) -> Option<Vec<usize>> {
        if rank >= self.devices.len() {
            return None;
        }

        let mut index = rank;
        let mut coordinate = vec![0; self.shape.len()];
        for (dim, &size) in self.shape.iter().enumerate().rev() {
            coordinate[dim] = index % size;
            index /= size;
        }
        Some(coordinate)
    }

    /// Rank of the device sitting at `coordinate`, or `None` if the coordinate is outside the mesh.
    pub fn rank_at(&self, coordinate: &[usize]) -> Option<usize> {
        if coordinate.len() != self.shape.len() {
            return None;
        }
        coordinate
            .iter()
            .zip(self.shape.iter())
            .try_fold(0, |rank, (&coord, &size)| {
                (coord < size).then_some(rank * size + coord)
            })
    }

    /// Rank of `device` in the mesh.
    pub fn rank_of(&self, device: &T) -> Option<usize>
    where
        T: PartialEq,
    {
        self.devices.iter().position(|d| d == device)
    }

    /// Returns the same mesh as seen from the process at `rank`, or from a process outside the
    /// mesh when `rank` is `None`.
    pub fn local_view(&self, rank: Option<usize>) -> Result<Self, DeviceMeshError>
    where
        T: Clone,
    {
        let mut mesh = self.clone();
        mesh.local_rank = validate_local_rank(rank, self.devices.len())?;
        Ok(mesh)
    }
}

impl<T: PartialEq> PartialEq for DeviceMesh<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.dims == other.dims && self.devices == other.devices
    }
}

impl<T: Eq> Eq for DeviceMesh<T> {}

impl<T: Hash> Hash for DeviceMesh<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.devices.hash(state);
        self.shape.hash(state);
        self.dims.hash(state);
    }
}

/// Represents errors that can occur when constructing a `DeviceMesh`.
///
/// These errors are typically related to invalid dimension mappings or mismatches
/// between the device count and the mesh shape.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DeviceMeshError {
    /// An invalid dimension was specified.
    #[error("invalid mesh dimension: {0}")]
    InvalidDimension(String),
    /// The mesh configuration is invalid.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
    /// The local rank does not designate a device of the mesh.
    #[error("invalid local rank: {0}")]
    InvalidLocalRank(String),
}

/// A builder for constructing a [`DeviceMesh`].
///
/// This builder allows you to define a logical mesh structure with a shape and
/// specific dimension mappings. Once all dimensions are mapped, the builder can
/// be used to construct the [`DeviceMesh`] instance.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder<T> {
    /// Physical devices in an n-dimensional logical arrangement.
    devices: Vec<T>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh.
    dims: HashMap<MeshDim, usize>,
    /// Position of the calling process in `devices`.
    local_rank: Option<usize>,
}

impl<T> DeviceMeshBuilder<T> {
    /// Creates a new [`DeviceMeshBuilder`] with the given devices and shape.
    ///
    /// # Arguments
    /// * `devices` - A vector of devices to be arranged in the mesh, in row-major order.
    /// * `shape` - A vector representing the shape (dimensions) of the mesh.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<T>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
            dims: HashMap::new(),
            local_rank: None,
        }
    }

    /// Adds a dimension to the logical mesh, associating it with a specific index.
    ///
    /// Each dimension represents a logical axis of parallelism and should correspond to a
    /// unique index in the shape of the mesh. Validation happens in [`build`](Self::build).
    ///
    /// # Arguments
    /// * `idx` - The index of the dimension in the mesh shape.
    /// * `dim` - The mesh dimension to be assigned.
    ///
    /// # Example
    ///
    /// ```rust
    /// use burn_dtensor::sharding::{DeviceMeshBuilder, MeshDim};
    ///
    /// let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
    ///     .with_dim(0, MeshDim::new("data_parallel"))
    ///     .with_dim(1, MeshDim::new("tensor_parallel"))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(mesh.ndim(), 2);
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Declares the rank of the calling process in the mesh.
    ///
    /// Without a local rank, the built mesh describes a process that does not take part in
    /// any collective on it.
    pub fn with_local_rank(mut self, rank: usize) -> Self {
        self.local_rank = Some(rank);
        self
    }

    /// Builds a [`DeviceMesh`] from the current configuration.
    ///
    /// This method performs validation to ensure that all dimensions are correctly
    /// mapped and that the number of devices matches the expected shape. If the
    /// validation fails, an error is returned.
    ///
    /// # Returns
    /// A `DeviceMesh` if the configuration is valid, or a `DeviceMeshError` if invalid.
    pub fn build(self) -> Result<DeviceMesh<T>, DeviceMeshError> {
        let ndim = self.shape.len();
        let mut seen_indices = HashSet::new();

        for &idx in self.dims.values() {
            if idx >= ndim {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Index {} exceeds mesh shape {:?}",
                    idx, self.shape
                )));
            }
            if !seen_indices.insert(idx) {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Dimension {} already mapped",
                    idx
                )));
            }
        }

        if seen_indices.len() != ndim {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Not all mesh dimensions are mapped. Got {}, expected {}",
                seen_indices.len(),
                ndim
            )));
        }

        if let Some(idx) = self.shape.iter().position(|&size| size == 0) {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Mesh dimension {} has size 0",
                idx
            )));
        }

        let expected_devices = self.shape.iter().product::<usize>();
        if self.devices.len() != expected_devices {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Device count ({}) doesn't match mesh shape {:?}",
                self.devices.len(),
                self.shape,
            )));
        }

        let local_rank = validate_local_rank(self.local_rank, self.devices.len())?;

        let mut dims: Vec<(usize, MeshDim)> =
            self.dims.into_iter().map(|(dim, idx)| (idx, dim)).collect();
        dims.sort_by_key(|(idx, _)| *idx);

        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
            dims: dims.into_iter().map(|(_, dim)| dim).collect(),
            local_rank,
        })
    }
}

fn validate_local_rank(
    rank: Option<usize>,
    num_devices: usize,
) -> Result<Option<usize>, DeviceMeshError> {
    match rank {
        Some(rank) if rank >= num_devices => Err(DeviceMeshError::InvalidLocalRank(format!(
            "Rank {} exceeds device count {}",
            rank, num_devices
        ))),
        rank => Ok(rank),
    }
}

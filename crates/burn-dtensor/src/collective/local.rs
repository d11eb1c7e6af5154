use std::sync::{Arc, Barrier, Mutex};

use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use hashbrown::HashMap;
use ndarray::{ArrayD, ArrayViewD};

use super::{Collective, CollectiveError, Element, ReduceOperation, check_shape};
use crate::sharding::DeviceMesh;

/// Buffers deposited by each rank of a group, indexed by group position.
type Slots<E> = Vec<Option<Vec<ArrayD<E>>>>;

/// Rendezvous point shared by the ranks of one group.
struct Rendezvous<E> {
    barrier: Barrier,
    slots: Mutex<Slots<E>>,
}

impl<E> Rendezvous<E> {
    fn new(size: usize) -> Self {
        Self {
            barrier: Barrier::new(size),
            slots: Mutex::new((0..size).map(|_| None).collect()),
        }
    }
}

/// In-process collective backend where every rank of a mesh is one thread.
///
/// [`LocalCollective::group`] creates one handle per rank of a mesh; each handle is moved to
/// the thread playing that rank. A collective deposits the rank's buffers in the group's
/// rendezvous, waits for the whole group, reads what it needs and waits again so the slots
/// can be reused by the next collective.
pub struct LocalCollective<E> {
    rank: usize,
    coordinate: Vec<usize>,
    shape: Vec<usize>,
    uniform_buffers: bool,
    groups: Arc<HashMap<(usize, usize), Rendezvous<E>>>,
}

impl<E: Element> LocalCollective<E> {
    /// Creates the collective handles of every rank of `mesh`, in rank order.
    pub fn group<T>(mesh: &DeviceMesh<T>) -> Vec<Self> {
        let shape = mesh.shape().to_vec();
        let coordinates: Vec<Vec<usize>> = (0..mesh.num_devices())
            .filter_map(|rank| mesh.coordinate_of(rank))
            .collect();

        let mut groups = HashMap::new();
        for coordinate in coordinates.iter() {
            for (mesh_dim, &size) in shape.iter().enumerate() {
                groups
                    .entry((mesh_dim, group_id(coordinate, &shape, mesh_dim)))
                    .or_insert_with(|| Rendezvous::new(size));
            }
        }
        let groups = Arc::new(groups);

        coordinates
            .into_iter()
            .enumerate()
            .map(|(rank, coordinate)| Self {
                rank,
                coordinate,
                shape: shape.clone(),
                uniform_buffers: true,
                groups: groups.clone(),
            })
            .collect()
    }

    /// Sets whether buffers exchanged in one collective must share the same shape.
    pub fn with_uniform_buffers(mut self, uniform_buffers: bool) -> Self {
        self.uniform_buffers = uniform_buffers;
        self
    }

    /// Rank played by this handle.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Deposits `contribution`, waits for the group, then runs `read` over every deposit.
    ///
    /// `read` runs between two barriers so every rank of the group observes the same deposits,
    /// and an error returned by `read` is returned by every rank alike.
    fn exchange<R>(
        &self,
        mesh_dim: usize,
        contribution: Option<Vec<ArrayD<E>>>,
        read: impl FnOnce(usize, &Slots<E>) -> Result<R, CollectiveError>,
    ) -> Result<R, CollectiveError> {
        if mesh_dim >= self.shape.len() {
            return Err(CollectiveError::MeshDimOutOfRange {
                mesh_dim,
                ndim: self.shape.len(),
            });
        }
        let position = self.coordinate[mesh_dim];
        let rendezvous = self
            .groups
            .get(&(mesh_dim, group_id(&self.coordinate, &self.shape, mesh_dim)))
            .ok_or_else(|| CollectiveError::Transport {
                message: format!("rank {} has no group on mesh dim {}", self.rank, mesh_dim),
            })?;

        {
            let mut slots = rendezvous.slots.lock().map_err(poisoned)?;
            slots[position] = contribution;
        }
        rendezvous.barrier.wait();
        let result = match rendezvous.slots.lock() {
            Ok(slots) => read(position, &slots),
            Err(err) => Err(poisoned(err)),
        };
        rendezvous.barrier.wait();

        result
    }

    fn check_uniform(&self, buffers: &[ArrayD<E>]) -> Result<(), CollectiveError> {
        if !self.uniform_buffers {
            return Ok(());
        }
        match buffers.split_first() {
            Some((first, rest)) => rest
                .iter()
                .try_for_each(|buffer| check_shape(first.shape(), buffer.shape())),
            None => Ok(()),
        }
    }

    fn check_count(&self, mesh_dim: usize, actual: usize) -> Result<(), CollectiveError> {
        let expected = self.shape[mesh_dim];
        if actual != expected {
            return Err(CollectiveError::BufferCountMismatch {
                mesh_dim,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

impl<E: Element> Collective<E> for LocalCollective<E> {
    fn scatter(
        &self,
        output: &mut ArrayD<E>,
        chunks: &[ArrayD<E>],
        mesh_dim: usize,
    ) -> Result<(), CollectiveError> {
        let is_source = self.coordinate.get(mesh_dim) == Some(&0);
        let contribution = is_source.then(|| chunks.to_vec());

        let received = self.exchange(mesh_dim, contribution, |position, slots| {
            let chunks = deposit(slots, 0)?;
            self.check_count(mesh_dim, chunks.len())?;
            self.check_uniform(chunks)?;
            Ok(chunks[position].clone())
        })?;

        check_shape(output.shape(), received.shape())?;
        output.assign(&received);
        Ok(())
    }

    fn all_gather(
        &self,
        outputs: &mut [ArrayD<E>],
        input: &ArrayD<E>,
        mesh_dim: usize,
    ) -> Result<(), CollectiveError> {
        let gathered = self.exchange(mesh_dim, Some(vec![input.clone()]), |_, slots| {
            let gathered = (0..slots.len())
                .map(|position| deposit(slots, position).map(|buffers| buffers[0].clone()))
                .collect::<Result<Vec<_>, CollectiveError>>()?;
            self.check_uniform(&gathered)?;
            Ok(gathered)
        })?;

        self.check_count(mesh_dim, outputs.len())?;
        for (output, received) in outputs.iter_mut().zip(gathered.iter()) {
            check_shape(output.shape(), received.shape())?;
            output.assign(received);
        }
        Ok(())
    }

    fn reduce_scatter(
        &self,
        output: &mut ArrayD<E>,
        chunks: &[ArrayD<E>],
        op: ReduceOperation,
        mesh_dim: usize,
    ) -> Result<(), CollectiveError> {
        let reduced = self.exchange(mesh_dim, Some(chunks.to_vec()), |position, slots| {
            let mut contributions: Vec<ArrayViewD<'_, E>> = Vec::with_capacity(slots.len());
            for peer in 0..slots.len() {
                let chunks = deposit(slots, peer)?;
                self.check_count(mesh_dim, chunks.len())?;
                self.check_uniform(chunks)?;
                contributions.push(chunks[position].view());
            }
            op.reduce(&contributions)
        })?;

        check_shape(output.shape(), reduced.shape())?;
        output.assign(&reduced);
        Ok(())
    }

    fn broadcast(&self, buffer: &mut ArrayD<E>, mesh_dim: usize) -> Result<(), CollectiveError> {
        let is_source = self.coordinate.get(mesh_dim) == Some(&0);
        let contribution = is_source.then(|| vec![buffer.clone()]);

        let received = self.exchange(mesh_dim, contribution, |_, slots| {
            Ok(deposit(slots, 0)?[0].clone())
        })?;

        check_shape(buffer.shape(), received.shape())?;
        buffer.assign(&received);
        Ok(())
    }

    fn all_reduce(
        &self,
        buffer: &mut ArrayD<E>,
        op: ReduceOperation,
        mesh_dim: usize,
    ) -> Result<(), CollectiveError> {
        let reduced = self.exchange(mesh_dim, Some(vec![buffer.clone()]), |_, slots| {
            let contributions = (0..slots.len())
                .map(|peer| deposit(slots, peer).map(|buffers| buffers[0].view()))
                .collect::<Result<Vec<_>, CollectiveError>>()?;
            op.reduce(&contributions)
        })?;

        check_shape(buffer.shape(), reduced.shape())?;
        buffer.assign(&reduced);
        Ok(())
    }

    fn requires_uniform_buffers(&self) -> bool {
        self.uniform_buffers
    }
}

/// Row-major index of `coordinate` with its entry on `mesh_dim` cleared, shared by the group.
fn group_id(coordinate: &[usize], shape: &[usize], mesh_dim: usize) -> usize {
    coordinate
        .iter()
        .zip(shape.iter())
        .enumerate()
        .fold(0, |id, (dim, (&coord, &size))| {
            id * size + if dim == mesh_dim { 0 } else { coord }
        })
}

fn deposit<E>(slots: &Slots<E>, position: usize) -> Result<&[ArrayD<E>], CollectiveError> {
    match slots.get(position) {
        Some(Some(buffers)) if !buffers.is_empty() => Ok(buffers),
        _ => Err(CollectiveError::Transport {
            message: format!("no buffer deposited by group position {}", position),
        }),
    }
}

fn poisoned<T>(_err: std::sync::PoisonError<T>) -> CollectiveError {
    CollectiveError::Transport {
        message: "rendezvous lock poisoned by a panicking rank".into(),
    }
}

//! Index arithmetic and buffer surgery for splitting one tensor dimension into chunks.
//!
//! A dimension of size `S` split into `C` chunks gives `split_size, pad_idx = divmod(S, C)`.
//! Chunks `0..pad_idx` hold `split_size + 1` elements and chunks `pad_idx..C` hold
//! `split_size`. When a collective needs uniform buffers, the short chunks are padded with one
//! trailing zero slab along the dimension, and unpadded once they come out of the collective.

use alloc::string::ToString;
use alloc::vec::Vec;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice};

use super::ShardingError;
use crate::collective::Element;

/// Returns `(split_size, pad_idx)` for a dimension of `size` elements split into `num_chunks`.
pub fn split_size(size: usize, num_chunks: usize) -> Result<(usize, usize), ShardingError> {
    split_size_on_dim(0, size, num_chunks)
}

fn split_size_on_dim(
    dim: usize,
    size: usize,
    num_chunks: usize,
) -> Result<(usize, usize), ShardingError> {
    if num_chunks == 0 {
        return Err(ShardingError::InvalidChunkCount);
    }
    if size < num_chunks {
        return Err(ShardingError::ChunkCountExceedsDim {
            dim,
            size,
            num_chunks,
        });
    }
    Ok((size / num_chunks, size % num_chunks))
}

/// Returns the size and the offset of chunk `index` of a dimension of `size` elements split
/// into `num_chunks`.
///
/// The offset is `index * split_size + min(index, pad_idx)`.
pub fn local_shard_size_on_dim(
    size: usize,
    num_chunks: usize,
    index: usize,
) -> Result<(usize, usize), ShardingError> {
    let (split_size, pad_idx) = split_size(size, num_chunks)?;
    if index >= num_chunks {
        return Err(ShardingError::ChunkIndexOutOfRange { index, num_chunks });
    }

    let local_size = if index < pad_idx {
        split_size + 1
    } else {
        split_size
    };
    let offset = index * split_size + index.min(pad_idx);
    Ok((local_size, offset))
}

/// Sizes of every chunk of a dimension of `size` elements split into `num_chunks`.
pub fn chunk_sizes(size: usize, num_chunks: usize) -> Result<Vec<usize>, ShardingError> {
    let (split_size, pad_idx) = split_size(size, num_chunks)?;
    Ok((0..num_chunks)
        .map(|index| split_size + usize::from(index < pad_idx))
        .collect())
}

/// Whether chunk `index` is one of the short chunks padded for a uniform collective.
pub fn is_padded(pad_idx: usize, index: usize) -> bool {
    pad_idx != 0 && index >= pad_idx
}

/// Splits `tensor` along `dim` into `num_chunks` chunks.
///
/// With `with_padding`, every short chunk is padded by one element along `dim` so all chunks
/// share the shape of the largest one. Returns the chunks and `pad_idx`.
pub fn split_tensor<E: Element>(
    tensor: &ArrayD<E>,
    dim: usize,
    num_chunks: usize,
    with_padding: bool,
) -> Result<(Vec<ArrayD<E>>, usize), ShardingError> {
    check_dim(tensor, dim)?;
    let size = tensor.len_of(Axis(dim));
    let (split_size, pad_idx) = split_size_on_dim(dim, size, num_chunks)?;

    let mut chunks = Vec::with_capacity(num_chunks);
    let mut start = 0;
    for index in 0..num_chunks {
        let len = split_size + usize::from(index < pad_idx);
        let chunk = tensor.slice_axis(Axis(dim), Slice::from(start..start + len));
        start += len;

        if with_padding && is_padded(pad_idx, index) {
            chunks.push(pad_view(chunk, dim)?);
        } else {
            chunks.push(chunk.to_owned());
        }
    }

    Ok((chunks, pad_idx))
}

/// Pads `tensor` by one zero element at the end of `dim`.
pub fn pad_tensor<E: Element>(tensor: &ArrayD<E>, dim: usize) -> Result<ArrayD<E>, ShardingError> {
    check_dim(tensor, dim)?;
    pad_view(tensor.view(), dim)
}

/// Removes the trailing element of `dim` added by [`pad_tensor`].
pub fn unpad_tensor<E: Element>(
    tensor: &ArrayD<E>,
    dim: usize,
) -> Result<ArrayD<E>, ShardingError> {
    check_dim(tensor, dim)?;
    let len = tensor.len_of(Axis(dim));
    if len == 0 {
        return Err(ShardingError::LocalSizeMismatch {
            dim,
            expected: 1,
            actual: 0,
        });
    }
    Ok(tensor.slice_axis(Axis(dim), Slice::from(0..len - 1)).to_owned())
}

/// Concatenates `chunks` along `dim`, in order.
pub fn concat_tensors<E: Element>(
    chunks: &[ArrayD<E>],
    dim: usize,
) -> Result<ArrayD<E>, ShardingError> {
    let views: Vec<ArrayViewD<'_, E>> = chunks.iter().map(|chunk| chunk.view()).collect();
    ndarray::concatenate(Axis(dim), &views).map_err(|err| ShardingError::Layout {
        message: err.to_string(),
    })
}

fn pad_view<E: Element>(tensor: ArrayViewD<'_, E>, dim: usize) -> Result<ArrayD<E>, ShardingError> {
    let mut pad_shape = tensor.shape().to_vec();
    pad_shape[dim] = 1;
    let padding = ArrayD::<E>::zeros(IxDyn(&pad_shape));

    ndarray::concatenate(Axis(dim), &[tensor.view(), padding.view()]).map_err(|err| {
        ShardingError::Layout {
            message: err.to_string(),
        }
    })
}

fn check_dim<E>(tensor: &ArrayD<E>, dim: usize) -> Result<(), ShardingError> {
    if dim >= tensor.ndim() {
        return Err(ShardingError::ShardDimOutOfRange {
            dim,
            ndim: tensor.ndim(),
        });
    }
    Ok(())
}

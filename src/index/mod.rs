//! In-memory embedding corpus.
//!
//! Vectors live in one contiguous `f32` array so a search can hand the whole
//! corpus to a compute device without gathering. Node ids are kept alongside
//! with a reverse map from id to position.
//!
//! # Serialized layout
//! All integers are little-endian `u32`:
//! `[dims][count]`, then `count` ids as `[len][utf-8 bytes]`, then
//! `count * dims` little-endian `f32` values row-major.

use std::collections::HashMap;

use serde::Serialize;

use crate::compute::kernels::normalize_in_place;
use crate::error::IndexError;
use crate::types::{NodeId, VectorDimension};

/// Summary of the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub count: usize,
    pub dimensions: usize,
    pub memory_bytes: usize,
    pub normalized: bool,
}

/// Flat-layout store of `(NodeId, vector)` pairs.
#[derive(Debug, Clone)]
pub struct EmbeddingIndex {
    dimension: VectorDimension,
    normalize: bool,
    ids: Vec<NodeId>,
    positions: HashMap<NodeId, usize>,
    vectors: Vec<f32>,
}

impl EmbeddingIndex {
    /// Creates an empty index. With `normalize` set every stored vector is
    /// scaled to unit length on insert.
    pub fn new(dimension: VectorDimension, normalize: bool) -> Self {
        Self::with_capacity(dimension, normalize, 0)
    }

    pub fn with_capacity(dimension: VectorDimension, normalize: bool, capacity: usize) -> Self {
        Self {
            dimension,
            normalize,
            ids: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
            vectors: Vec::with_capacity(capacity.saturating_mul(dimension.get())),
        }
    }

    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    /// Whether stored vectors are unit length.
    pub fn is_normalized(&self) -> bool {
        self.normalize
    }

    /// Inserts a vector, or replaces it in place when the id is present.
    ///
    /// Returns `true` when the id was new.
    pub fn add(&mut self, id: NodeId, vector: &[f32]) -> Result<bool, IndexError> {
        self.dimension.validate_vector(vector)?;
        let dims = self.dimension.get();

        if let Some(&position) = self.positions.get(&id) {
            let slot = &mut self.vectors[position * dims..(position + 1) * dims];
            slot.copy_from_slice(vector);
            if self.normalize {
                normalize_in_place(slot);
            }
            return Ok(false);
        }

        let start = self.vectors.len();
        self.vectors.extend_from_slice(vector);
        if self.normalize {
            normalize_in_place(&mut self.vectors[start..]);
        }
        self.positions.insert(id.clone(), self.ids.len());
        self.ids.push(id);
        Ok(true)
    }

    /// Inserts many vectors. Validates every dimension before touching the
    /// index, so a bad batch changes nothing.
    pub fn add_batch(&mut self, ids: &[NodeId], vectors: &[Vec<f32>]) -> Result<usize, IndexError> {
        if ids.len() != vectors.len() {
            return Err(IndexError::LengthMismatch {
                ids: ids.len(),
                vectors: vectors.len(),
            });
        }
        for vector in vectors {
            self.dimension.validate_vector(vector)?;
        }

        self.ids.reserve(ids.len());
        self.vectors.reserve(ids.len() * self.dimension.get());
        let mut inserted = 0;
        for (id, vector) in ids.iter().zip(vectors) {
            if self.add(id.clone(), vector)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Removes an id by moving the last entry into its slot.
    ///
    /// Returns `false` when the id was not present.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        let Some(position) = self.positions.remove(id) else {
            return false;
        };
        let dims = self.dimension.get();
        let last = self.ids.len() - 1;

        if position != last {
            self.vectors
                .copy_within(last * dims..(last + 1) * dims, position * dims);
            self.ids.swap(position, last);
            self.positions.insert(self.ids[position].clone(), position);
        }
        self.ids.pop();
        self.vectors.truncate(last * dims);
        true
    }

    /// Vector stored for `id`.
    pub fn get(&self, id: &NodeId) -> Option<&[f32]> {
        let position = *self.positions.get(id)?;
        Some(self.row(position))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.positions.contains_key(id)
    }

    /// Position of `id` in the flat layout.
    pub fn position_of(&self, id: &NodeId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.positions.clear();
        self.vectors.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// All vectors, row-major.
    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    /// Vector at a position.
    pub fn row(&self, position: usize) -> &[f32] {
        let dims = self.dimension.get();
        &self.vectors[position * dims..(position + 1) * dims]
    }

    /// Id at a position of the flat layout.
    pub fn id_at(&self, position: usize) -> Option<&NodeId> {
        self.ids.get(position)
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    /// Approximate heap usage: vectors plus id bookkeeping.
    pub fn memory_usage_bytes(&self) -> usize {
        let vectors = self.vectors.capacity() * std::mem::size_of::<f32>();
        let ids: usize = self
            .ids
            .iter()
            .map(|id| id.as_str().len() + std::mem::size_of::<NodeId>())
            .sum();
        let map = self.positions.capacity()
            * (std::mem::size_of::<NodeId>() + std::mem::size_of::<usize>());
        vectors + ids + map
    }

    /// Encodes the whole corpus in the serialized layout.
    pub fn serialize(&self) -> Vec<u8> {
        let id_bytes: usize = self.ids.iter().map(|id| 4 + id.as_str().len()).sum();
        let mut out = Vec::with_capacity(8 + id_bytes + self.vectors.len() * 4);
        out.extend_from_slice(&(self.dimension.get() as u32).to_le_bytes());
        out.extend_from_slice(&(self.ids.len() as u32).to_le_bytes());
        for id in &self.ids {
            let bytes = id.as_str().as_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        for value in &self.vectors {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Replaces the contents with a corpus encoded by [`Self::serialize`].
    ///
    /// The encoded dimension must match this index. On error the index is
    /// left untouched. Returns the number of embeddings loaded.
    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<usize, IndexError> {
        let mut reader = ByteReader::new(bytes);
        let dims = reader.u32()? as usize;
        if dims != self.dimension.get() {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension.get(),
                actual: dims,
            });
        }

        let count = reader.u32()? as usize;
        // Every id takes at least its length prefix
        let capacity = count.min(reader.remaining() / 4);
        let mut ids = Vec::with_capacity(capacity);
        let mut positions = HashMap::with_capacity(capacity);
        for position in 0..count {
            let len = reader.u32()? as usize;
            let raw = reader.take(len)?;
            let id = std::str::from_utf8(raw)
                .map_err(|e| corrupt(format!("id at position {position} is not UTF-8: {e}")))?;
            let id = NodeId::new(id);
            if positions.insert(id.clone(), position).is_some() {
                return Err(corrupt(format!("duplicate id '{id}'")));
            }
            ids.push(id);
        }

        let value_bytes = count
            .checked_mul(dims)
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| corrupt(format!("{count} vectors of {dims} values overflow")))?;
        let mut vectors: Vec<f32> = reader
            .take(value_bytes)?
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if reader.remaining() != 0 {
            return Err(corrupt(format!("{} trailing bytes", reader.remaining())));
        }

        if self.normalize {
            for row in vectors.chunks_exact_mut(dims) {
                normalize_in_place(row);
            }
        }
        self.ids = ids;
        self.positions = positions;
        self.vectors = vectors;
        Ok(count)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            count: self.len(),
            dimensions: self.dimension.get(),
            memory_bytes: self.memory_usage_bytes(),
            normalized: self.normalize,
        }
    }
}

fn corrupt(reason: String) -> IndexError {
    IndexError::Corrupt { reason }
}

/// Bounds-checked cursor over a serialized index.
struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], IndexError> {
        if len > self.remaining() {
            return Err(corrupt(format!(
                "truncated at byte {}: needed {len} more bytes, {} left",
                self.offset,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, IndexError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

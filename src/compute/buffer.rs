//! Device-visible memory with an explicit storage mode.
//!
//! A [`Buffer`] is owned by exactly one holder and is released either
//! explicitly through [`Buffer::release`] or when it is dropped. Contents are
//! kept as 32-bit words so the same allocation can hold `f32` scores or `u32`
//! indices; views are produced with `bytemuck` casts.
//!
//! Managed buffers keep two copies. Host writes land in the mirror and only
//! reach the device copy through [`Buffer::did_modify`], which `write_*`
//! call for their own range. Kernels always read the device copy.

use std::ops::{Deref, DerefMut, Range};
use std::sync::Arc;

use super::device::DeviceShared;
use super::types::StorageMode;
use crate::error::{ComputeError, ComputeResult};

const WORD: usize = std::mem::size_of::<u32>();

/// Backing words: owned by the buffer, or borrowed from the caller for the
/// no-copy form.
enum Words<'a> {
    Owned(Vec<u32>),
    Borrowed(&'a mut [u32]),
}

impl Deref for Words<'_> {
    type Target = [u32];

    fn deref(&self) -> &[u32] {
        match self {
            Words::Owned(words) => words,
            Words::Borrowed(words) => words,
        }
    }
}

impl DerefMut for Words<'_> {
    fn deref_mut(&mut self) -> &mut [u32] {
        match self {
            Words::Owned(words) => words,
            Words::Borrowed(words) => words,
        }
    }
}

/// Fixed-size memory region created by a compute device.
pub struct Buffer<'a> {
    owner: Arc<DeviceShared>,
    mode: StorageMode,
    no_copy: bool,
    size_bytes: usize,
    /// Memory kernels read and write. Shared buffers expose it to the host.
    device: Words<'a>,
    /// Host mirror, present only for managed buffers.
    mirror: Option<Vec<u32>>,
    released: bool,
}

impl std::fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("mode", &self.mode)
            .field("no_copy", &self.no_copy)
            .field("size_bytes", &self.size_bytes)
            .field("released", &self.released)
            .finish()
    }
}

impl Buffer<'static> {
    /// Wraps freshly allocated words. Accounting was reserved by the caller.
    pub(crate) fn owned(owner: Arc<DeviceShared>, words: Vec<u32>, mode: StorageMode) -> Self {
        let size_bytes = words.len() * WORD;
        let mirror = (mode == StorageMode::Managed).then(|| words.clone());
        Self {
            owner,
            mode,
            no_copy: false,
            size_bytes,
            device: Words::Owned(words),
            mirror,
            released: false,
        }
    }
}

impl<'a> Buffer<'a> {
    /// Aliases caller memory. Only shared storage can alias.
    pub(crate) fn borrowed(owner: Arc<DeviceShared>, words: &'a mut [u32]) -> Self {
        Self {
            owner,
            mode: StorageMode::Shared,
            no_copy: true,
            size_bytes: words.len() * WORD,
            device: Words::Borrowed(words),
            mirror: None,
            released: false,
        }
    }

    /// Size of the buffer in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Number of 32-bit elements the buffer holds.
    pub fn len(&self) -> usize {
        self.size_bytes / WORD
    }

    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    /// Whether the buffer aliases caller memory.
    pub fn is_no_copy(&self) -> bool {
        self.no_copy
    }

    /// False once the buffer or its device has been released.
    pub fn is_valid(&self) -> bool {
        !self.released && !self.owner.is_released()
    }

    fn ensure_valid(&self) -> ComputeResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(ComputeError::InvalidBuffer)
        }
    }

    fn ensure_host_access(&self) -> ComputeResult<()> {
        self.ensure_valid()?;
        if self.mode.host_visible() {
            Ok(())
        } else {
            Err(ComputeError::HostAccessDenied)
        }
    }

    fn host_words(&self) -> &[u32] {
        match &self.mirror {
            Some(mirror) => mirror,
            None => &self.device,
        }
    }

    fn host_words_mut(&mut self) -> &mut [u32] {
        match &mut self.mirror {
            Some(mirror) => mirror,
            None => &mut self.device,
        }
    }

    fn read_words(&self, count: usize) -> ComputeResult<&[u32]> {
        self.ensure_host_access()?;
        let capacity = self.len();
        if count > capacity {
            return Err(ComputeError::ReadOutOfBounds { count, capacity });
        }
        self.owner.record_transfer(count * WORD);
        Ok(&self.host_words()[..count])
    }

    /// Copies the first `count` elements out as `f32`.
    pub fn read_f32(&self, count: usize) -> ComputeResult<Vec<f32>> {
        let words = self.read_words(count)?;
        Ok(bytemuck::cast_slice::<u32, f32>(words).to_vec())
    }

    /// Copies the first `count` elements out as `u32`.
    pub fn read_u32(&self, count: usize) -> ComputeResult<Vec<u32>> {
        Ok(self.read_words(count)?.to_vec())
    }

    fn write_words(&mut self, data: &[u32], offset: usize) -> ComputeResult<()> {
        self.ensure_host_access()?;
        let capacity = self.len();
        let end = offset.checked_add(data.len()).filter(|&end| end <= capacity);
        let Some(end) = end else {
            return Err(ComputeError::WriteOutOfBounds {
                offset,
                len: data.len(),
                capacity,
            });
        };
        self.host_words_mut()[offset..end].copy_from_slice(data);
        self.owner.record_transfer(data.len() * WORD);
        self.did_modify(offset * WORD..end * WORD)
    }

    /// Copies `data` in starting at element `offset`.
    pub fn write_f32(&mut self, data: &[f32], offset: usize) -> ComputeResult<()> {
        self.write_words(bytemuck::cast_slice(data), offset)
    }

    /// Copies `data` in starting at element `offset`.
    pub fn write_u32(&mut self, data: &[u32], offset: usize) -> ComputeResult<()> {
        self.write_words(data, offset)
    }

    /// Host view of the contents.
    pub fn contents(&self) -> ComputeResult<&[f32]> {
        self.ensure_host_access()?;
        Ok(bytemuck::cast_slice(self.host_words()))
    }

    /// Mutable host view. For managed buffers the edits stay in the host
    /// mirror until [`Buffer::did_modify`] is called for the edited range.
    pub fn contents_mut(&mut self) -> ComputeResult<&mut [f32]> {
        self.ensure_host_access()?;
        Ok(bytemuck::cast_slice_mut(self.host_words_mut()))
    }

    /// Publishes a modified byte range of the host mirror to the device.
    ///
    /// A no-op for shared buffers. Partial words at either end of the range
    /// are synchronized whole.
    pub fn did_modify(&mut self, range: Range<usize>) -> ComputeResult<()> {
        self.ensure_host_access()?;
        if range.start > range.end || range.end > self.size_bytes {
            return Err(ComputeError::WriteOutOfBounds {
                offset: range.start / WORD,
                len: range.end.saturating_sub(range.start).div_ceil(WORD),
                capacity: self.len(),
            });
        }
        if let Some(mirror) = &self.mirror {
            let words = range.start / WORD..range.end.div_ceil(WORD);
            self.device[words.clone()].copy_from_slice(&mirror[words]);
        }
        Ok(())
    }

    /// Device copy as seen by kernels.
    pub(crate) fn device_f32(&self) -> ComputeResult<&[f32]> {
        self.ensure_valid()?;
        Ok(bytemuck::cast_slice(&self.device))
    }

    pub(crate) fn device_u32(&self) -> ComputeResult<&[u32]> {
        self.ensure_valid()?;
        Ok(&self.device)
    }

    pub(crate) fn device_f32_mut(&mut self) -> ComputeResult<&mut [f32]> {
        self.ensure_valid()?;
        Ok(bytemuck::cast_slice_mut(&mut self.device))
    }

    pub(crate) fn device_u32_mut(&mut self) -> ComputeResult<&mut [u32]> {
        self.ensure_valid()?;
        Ok(&mut self.device)
    }

    /// Copies kernel output back into the host mirror of a managed buffer.
    pub(crate) fn sync_to_host(&mut self, words: Range<usize>) {
        if let Some(mirror) = &mut self.mirror {
            mirror[words.clone()].copy_from_slice(&self.device[words]);
        }
    }

    pub(crate) fn belongs_to(&self, owner: &Arc<DeviceShared>) -> bool {
        Arc::ptr_eq(&self.owner, owner)
    }

    /// Releases the buffer. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.owner.free(self.size_bytes);
        if let Words::Owned(words) = &mut self.device {
            *words = Vec::new();
        }
        self.mirror = None;
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Kernel-facing primitives used by the command engine.
//!
//! A backend is the provider of GPU memory objects and of the execution queues batches are
//! submitted to, most likely the i915 kernel driver. The engine only depends on the two traits
//! defined here: [`MemoryManager`] and [`ExecQueue`]. The [`memory`] backend implements both in
//! process memory so the engine can run without a GPU.

pub mod memory;

use thiserror::Error;

pub const I915_GEM_DOMAIN_CPU: u32 = 0x0000_0001;
pub const I915_GEM_DOMAIN_RENDER: u32 = 0x0000_0002;
pub const I915_GEM_DOMAIN_SAMPLER: u32 = 0x0000_0004;
pub const I915_GEM_DOMAIN_COMMAND: u32 = 0x0000_0008;
pub const I915_GEM_DOMAIN_INSTRUCTION: u32 = 0x0000_0010;
pub const I915_GEM_DOMAIN_VERTEX: u32 = 0x0000_0020;
pub const I915_GEM_DOMAIN_GTT: u32 = 0x0000_0040;

/// Kernel handle of a memory object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoHandle(pub u32);

/// Execution ring a batch is submitted to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Ring {
    /// 3D/media pipeline.
    #[default]
    Render,
    /// Bitstream decoder (MFX/BSD) pipeline.
    Bsd,
    /// Blitter.
    Blt,
}

/// Tiling layout of a memory object.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Tiling {
    #[default]
    None,
    X,
    Y,
}

/// Completion handle returned by [`ExecQueue::submit`].
///
/// Completion is never waited on explicitly: mapping any object used by the submission waits for
/// it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fence(pub u64);

/// Address patch passed to the kernel along with a batch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RelocationEntry {
    /// Byte offset of the patched word inside the batch.
    pub offset: usize,
    /// Object whose address is written at `offset`.
    pub target: BoHandle,
    pub read_domains: u32,
    pub write_domain: u32,
    /// Added to the final address of `target`.
    pub delta: u32,
}

/// Error returned by backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("kernel cannot allocate {size} bytes for {name}")]
    OutOfMemory { name: String, size: usize },
    #[error("unknown memory object {0:?}")]
    InvalidHandle(BoHandle),
    #[error("memory object {0:?} is not mapped")]
    NotMapped(BoHandle),
    #[error("memory object {0:?} is still mapped")]
    StillMapped(BoHandle),
    #[error("access of {len} bytes at offset {offset} is out of bounds of {handle:?}")]
    OutOfBounds {
        handle: BoHandle,
        offset: usize,
        len: usize,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by backend methods.
pub type BackendResult<T> = Result<T, BackendError>;

/// Memory object primitives of the kernel driver.
pub trait MemoryManager {
    /// Allocates a new object of `size` bytes aligned to `alignment` in the GPU address space.
    fn alloc(&self, name: &str, size: usize, alignment: usize) -> BackendResult<BoHandle>;

    /// Releases `handle`. The kernel keeps the memory alive until pending submissions using it
    /// retire.
    fn free(&self, handle: BoHandle);

    /// Makes `handle` accessible to the CPU, waiting for any pending GPU use of it first.
    fn map(&self, handle: BoHandle) -> BackendResult<()>;

    fn unmap(&self, handle: BoHandle) -> BackendResult<()>;

    /// Writes `data` at `offset` of the mapped object `handle`.
    fn write(&self, handle: BoHandle, offset: usize, data: &[u8]) -> BackendResult<()>;

    /// Reads `data.len()` bytes at `offset` of the mapped object `handle`.
    fn read(&self, handle: BoHandle, offset: usize, data: &mut [u8]) -> BackendResult<()>;

    fn set_tiling(&self, handle: BoHandle, tiling: Tiling, stride: u32) -> BackendResult<()>;

    /// The GPU address the object is expected to live at. Relocations fix it up at submission if
    /// the kernel moved the object.
    fn presumed_offset(&self, handle: BoHandle) -> BackendResult<u64>;
}

/// Submission primitive of the kernel driver.
pub trait ExecQueue {
    /// Queues the first `used` bytes of `batch` for execution on `ring` after applying
    /// `relocations`. Returns as soon as the batch is queued.
    fn submit(
        &self,
        batch: BoHandle,
        used: usize,
        relocations: &[RelocationEntry],
        ring: Ring,
    ) -> BackendResult<Fence>;
}

/// A complete kernel backend.
pub trait Kernel: MemoryManager + ExecQueue {}

impl<T: MemoryManager + ExecQueue + ?Sized> Kernel for T {}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A kernel backend living entirely in process memory.
//!
//! Memory objects are plain byte vectors placed at increasing fake GPU addresses, and submitted
//! batches are recorded (with their relocations applied) instead of being executed. This lets the
//! command engine run, and be inspected, without a GPU.

use std::cell::Ref;
use std::cell::RefCell;
use std::collections::BTreeMap;

use anyhow::anyhow;
use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::BoHandle;
use crate::backend::ExecQueue;
use crate::backend::Fence;
use crate::backend::MemoryManager;
use crate::backend::RelocationEntry;
use crate::backend::Ring;
use crate::backend::Tiling;

/// First fake GPU address handed out. Keeps address 0 invalid.
const GPU_BASE: u64 = 0x0010_0000;

struct Object {
    name: String,
    data: Vec<u8>,
    gpu_offset: u64,
    tiling: Tiling,
    stride: u32,
    mapped: bool,
    /// Set while a submission that uses the object has not been waited on.
    busy: bool,
}

/// A batch recorded by [`MemoryKernel::submit`].
#[derive(Clone, Debug)]
pub struct Submission {
    pub fence: Fence,
    pub ring: Ring,
    /// Contents of the batch, with relocations applied.
    pub words: Vec<u32>,
    pub relocations: Vec<RelocationEntry>,
}

impl Submission {
    /// CRC32 of the submitted bytes, for comparing command streams.
    pub fn checksum(&self) -> u32 {
        let mut bytes = vec![0u8; self.words.len() * 4];
        LittleEndian::write_u32_into(&self.words, &mut bytes);
        crc32fast::hash(&bytes)
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<BoHandle, Object>,
    next_handle: u32,
    next_gpu_offset: u64,
    allocated_bytes: usize,
    memory_limit: Option<usize>,
    submissions: Vec<Submission>,
    waits: usize,
}

/// In-memory implementation of [`MemoryManager`] and [`ExecQueue`].
#[derive(Default)]
pub struct MemoryKernel {
    state: RefCell<State>,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a kernel that fails allocations once `limit` bytes are live.
    pub fn with_memory_limit(limit: usize) -> Self {
        let kernel = Self::new();
        kernel.state.borrow_mut().memory_limit = Some(limit);
        kernel
    }

    /// Every batch submitted so far, in submission order.
    pub fn submissions(&self) -> Ref<'_, Vec<Submission>> {
        Ref::map(self.state.borrow(), |s| &s.submissions)
    }

    /// Number of live memory objects.
    pub fn live_objects(&self) -> usize {
        self.state.borrow().objects.len()
    }

    /// Whether `handle` is still allocated.
    pub fn is_live(&self, handle: BoHandle) -> bool {
        self.state.borrow().objects.contains_key(&handle)
    }

    /// Number of times a map had to wait for a submission to retire.
    pub fn waits(&self) -> usize {
        self.state.borrow().waits
    }

    pub fn tiling(&self, handle: BoHandle) -> Option<(Tiling, u32)> {
        self.state
            .borrow()
            .objects
            .get(&handle)
            .map(|o| (o.tiling, o.stride))
    }
}

impl State {
    fn object(&self, handle: BoHandle) -> BackendResult<&Object> {
        self.objects
            .get(&handle)
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn object_mut(&mut self, handle: BoHandle) -> BackendResult<&mut Object> {
        self.objects
            .get_mut(&handle)
            .ok_or(BackendError::InvalidHandle(handle))
    }
}

fn check_bounds(handle: BoHandle, object: &Object, offset: usize, len: usize) -> BackendResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= object.data.len() => Ok(()),
        _ => Err(BackendError::OutOfBounds {
            handle,
            offset,
            len,
        }),
    }
}

impl MemoryManager for MemoryKernel {
    fn alloc(&self, name: &str, size: usize, alignment: usize) -> BackendResult<BoHandle> {
        let mut state = self.state.borrow_mut();

        if let Some(limit) = state.memory_limit {
            if state.allocated_bytes + size > limit {
                return Err(BackendError::OutOfMemory {
                    name: name.to_owned(),
                    size,
                });
            }
        }

        let alignment = alignment.max(1) as u64;
        let base = GPU_BASE.max(state.next_gpu_offset);
        let gpu_offset = base.div_ceil(alignment) * alignment;

        state.next_handle += 1;
        let handle = BoHandle(state.next_handle);
        state.next_gpu_offset = gpu_offset + size as u64;
        state.allocated_bytes += size;
        state.objects.insert(
            handle,
            Object {
                name: name.to_owned(),
                data: vec![0; size],
                gpu_offset,
                tiling: Tiling::None,
                stride: 0,
                mapped: false,
                busy: false,
            },
        );

        Ok(handle)
    }

    fn free(&self, handle: BoHandle) {
        let mut state = self.state.borrow_mut();
        match state.objects.remove(&handle) {
            Some(object) => state.allocated_bytes -= object.data.len(),
            None => log::warn!("freeing unknown memory object {:?}", handle),
        }
    }

    fn map(&self, handle: BoHandle) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        let object = state.object_mut(handle)?;
        let waited = std::mem::replace(&mut object.busy, false);
        object.mapped = true;

        if waited {
            log::trace!("waited for {} to retire before mapping", object.name);
            state.waits += 1;
        }

        Ok(())
    }

    fn unmap(&self, handle: BoHandle) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        let object = state.object_mut(handle)?;
        if !object.mapped {
            return Err(BackendError::NotMapped(handle));
        }
        object.mapped = false;

        Ok(())
    }

    fn write(&self, handle: BoHandle, offset: usize, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        let object = state.object_mut(handle)?;
        if !object.mapped {
            return Err(BackendError::NotMapped(handle));
        }
        check_bounds(handle, object, offset, data.len())?;
        object.data[offset..offset + data.len()].copy_from_slice(data);

        Ok(())
    }

    fn read(&self, handle: BoHandle, offset: usize, data: &mut [u8]) -> BackendResult<()> {
        let state = self.state.borrow();
        let object = state.object(handle)?;
        if !object.mapped {
            return Err(BackendError::NotMapped(handle));
        }
        check_bounds(handle, object, offset, data.len())?;
        data.copy_from_slice(&object.data[offset..offset + data.len()]);

        Ok(())
    }

    fn set_tiling(&self, handle: BoHandle, tiling: Tiling, stride: u32) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        let object = state.object_mut(handle)?;
        object.tiling = tiling;
        object.stride = stride;

        Ok(())
    }

    fn presumed_offset(&self, handle: BoHandle) -> BackendResult<u64> {
        Ok(self.state.borrow().object(handle)?.gpu_offset)
    }
}

impl ExecQueue for MemoryKernel {
    fn submit(
        &self,
        batch: BoHandle,
        used: usize,
        relocations: &[RelocationEntry],
        ring: Ring,
    ) -> BackendResult<Fence> {
        let mut state = self.state.borrow_mut();

        let object = state.object(batch)?;
        if object.mapped {
            return Err(BackendError::StillMapped(batch));
        }
        check_bounds(batch, object, 0, used)?;
        if used % 4 != 0 {
            return Err(anyhow!("batch length {} is not a whole number of words", used).into());
        }

        let mut words = vec![0u32; used / 4];
        LittleEndian::read_u32_into(&object.data[..used], &mut words);

        for reloc in relocations {
            let target = state.object(reloc.target)?;
            let address = target.gpu_offset + u64::from(reloc.delta);
            let index = reloc.offset / 4;
            if reloc.offset % 4 != 0 || index >= words.len() {
                return Err(anyhow!("relocation at byte {} is outside the batch", reloc.offset).into());
            }
            words[index] = address as u32;
        }

        for handle in std::iter::once(batch).chain(relocations.iter().map(|r| r.target)) {
            state.object_mut(handle)?.busy = true;
        }

        let fence = Fence(state.submissions.len() as u64 + 1);
        log::trace!(
            "queued {} words on {:?} with {} relocations",
            words.len(),
            ring,
            relocations.len()
        );
        state.submissions.push(Submission {
            fence,
            ring,
            words,
            relocations: relocations.to_vec(),
        });

        Ok(fence)
    }
}

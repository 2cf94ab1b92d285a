// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference-counted kernel memory objects.

use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use crate::backend::BackendResult;
use crate::backend::BoHandle;
use crate::backend::Kernel;
use crate::backend::Tiling;

struct BoInner {
    handle: BoHandle,
    size: usize,
    name: String,
    kernel: Rc<dyn Kernel>,
}

impl Drop for BoInner {
    fn drop(&mut self) {
        log::trace!("releasing {} ({:?}, {} bytes)", self.name, self.handle, self.size);
        self.kernel.free(self.handle);
    }
}

/// A GPU memory object.
///
/// Cloning a `Bo` adds an owner. The kernel object is freed when the last clone is dropped, so
/// a picture held by both the reference table and the display queue stays alive until both
/// release it.
#[derive(Clone)]
pub struct Bo(Rc<BoInner>);

impl Bo {
    /// Allocates a new object of `size` bytes from `kernel`.
    pub fn alloc(
        kernel: &Rc<dyn Kernel>,
        name: &str,
        size: usize,
        alignment: usize,
    ) -> BackendResult<Self> {
        let handle = kernel.alloc(name, size, alignment)?;
        log::trace!("allocated {} ({:?}, {} bytes)", name, handle, size);

        Ok(Self(Rc::new(BoInner {
            handle,
            size,
            name: name.to_owned(),
            kernel: Rc::clone(kernel),
        })))
    }

    pub fn handle(&self) -> BoHandle {
        self.0.handle
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Number of owners currently retaining this object.
    pub fn owners(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Whether `self` and `other` are the same kernel object.
    pub fn ptr_eq(&self, other: &Bo) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakBo {
        WeakBo(Rc::downgrade(&self.0))
    }

    /// Maps the object for CPU access. Blocks until the GPU is done with it.
    pub fn map(&self) -> BackendResult<()> {
        self.0.kernel.map(self.0.handle)
    }

    pub fn unmap(&self) -> BackendResult<()> {
        self.0.kernel.unmap(self.0.handle)
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> BackendResult<()> {
        self.0.kernel.write(self.0.handle, offset, data)
    }

    pub fn read(&self, offset: usize, data: &mut [u8]) -> BackendResult<()> {
        self.0.kernel.read(self.0.handle, offset, data)
    }

    pub fn set_tiling(&self, tiling: Tiling, stride: u32) -> BackendResult<()> {
        self.0.kernel.set_tiling(self.0.handle, tiling, stride)
    }

    pub fn presumed_offset(&self) -> BackendResult<u64> {
        self.0.kernel.presumed_offset(self.0.handle)
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("name", &self.0.name)
            .field("handle", &self.0.handle)
            .field("size", &self.0.size)
            .finish()
    }
}

/// A non-owning reference to a [`Bo`].
#[derive(Clone, Default)]
pub struct WeakBo(Weak<BoInner>);

impl WeakBo {
    /// Returns the object if some owner still retains it.
    pub fn upgrade(&self) -> Option<Bo> {
        self.0.upgrade().map(Bo)
    }
}

impl fmt::Debug for WeakBo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(bo) => f.debug_tuple("WeakBo").field(&bo.handle()).finish(),
            None => f.write_str("WeakBo(released)"),
        }
    }
}

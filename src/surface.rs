// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode surfaces and their backing memory.
//!
//! A surface remembers its backing memory weakly and the memory lives as long as someone retains
//! it. Once a picture has been decoded, the surface itself retains it until it has been handed to
//! the display path and, for reference pictures, until it leaves the reference table. A surface
//! whose memory was released gets new memory on demand if it is used again.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::rc::Rc;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::Kernel;
use crate::backend::Tiling;
use crate::bo::Bo;
use crate::bo::WeakBo;
use crate::Resolution;

const SURFACE_ALIGNMENT: usize = 0x1000;
/// Surfaces are allocated in whole macroblocks.
const MACROBLOCK_SIZE: u32 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("unknown surface {0:?}")]
    UnknownSurface(SurfaceId),
    #[error("surface {0:?} has no content")]
    NoContent(SurfaceId),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

struct SurfaceEntry {
    resolution: Resolution,
    /// `resolution` rounded up to whole macroblocks.
    coded_resolution: Resolution,
    backing: WeakBo,
    /// Held from decode for as long as the picture may be referenced by a later frame.
    reference_hold: Option<Bo>,
    /// Held from decode until the picture is queued for display.
    display_hold: Option<Bo>,
}

fn align_to_macroblock(value: u32) -> u32 {
    value.div_ceil(MACROBLOCK_SIZE) * MACROBLOCK_SIZE
}

/// All the surfaces of a decode context.
pub struct SurfaceTable {
    kernel: Rc<dyn Kernel>,
    surfaces: BTreeMap<SurfaceId, SurfaceEntry>,
    next_id: u32,
}

impl SurfaceTable {
    pub fn new(kernel: Rc<dyn Kernel>) -> Self {
        Self {
            kernel,
            surfaces: Default::default(),
            next_id: 0,
        }
    }

    /// Creates `count` surfaces of `resolution`. No memory is allocated yet.
    pub fn create_surfaces(&mut self, resolution: Resolution, count: usize) -> Vec<SurfaceId> {
        let coded_resolution = Resolution {
            width: align_to_macroblock(resolution.width),
            height: align_to_macroblock(resolution.height),
        };

        (0..count)
            .map(|_| {
                let id = SurfaceId(self.next_id);
                self.next_id += 1;
                self.surfaces.insert(
                    id,
                    SurfaceEntry {
                        resolution,
                        coded_resolution,
                        backing: Default::default(),
                        reference_hold: None,
                        display_hold: None,
                    },
                );
                id
            })
            .collect()
    }

    /// Forgets `id`. Memory still retained elsewhere stays alive until released.
    pub fn destroy_surface(&mut self, id: SurfaceId) -> Result<(), SurfaceError> {
        self.surfaces
            .remove(&id)
            .map(|_| ())
            .ok_or(SurfaceError::UnknownSurface(id))
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn resolution(&self, id: SurfaceId) -> Option<Resolution> {
        self.surfaces.get(&id).map(|s| s.resolution)
    }

    /// The allocated size of `id`, in whole macroblocks.
    pub fn coded_resolution(&self, id: SurfaceId) -> Option<Resolution> {
        self.surfaces.get(&id).map(|s| s.coded_resolution)
    }

    /// The backing memory of `id`, if it is currently retained by anyone.
    pub fn backing(&self, id: SurfaceId) -> Option<Bo> {
        self.surfaces.get(&id).and_then(|s| s.backing.upgrade())
    }

    /// The backing memory of `id`, allocated if nobody retains it.
    ///
    /// Surfaces are NV12, Y-tiled, with a pitch equal to their coded width.
    pub fn ensure_backing(&mut self, id: SurfaceId) -> Result<Bo, SurfaceError> {
        let entry = self
            .surfaces
            .get_mut(&id)
            .ok_or(SurfaceError::UnknownSurface(id))?;

        if let Some(bo) = entry.backing.upgrade() {
            return Ok(bo);
        }

        let Resolution { width, height } = entry.coded_resolution;
        let size = width as usize * (height as usize + height as usize / 2);
        let bo = Bo::alloc(&self.kernel, "vaapi surface", size, SURFACE_ALIGNMENT)?;
        bo.set_tiling(Tiling::Y, width)?;

        log::debug!("allocated backing memory for {:?} ({}x{})", id, width, height);
        entry.backing = bo.downgrade();

        Ok(bo)
    }

    /// Records that `backing` now holds a freshly decoded picture for `id`.
    ///
    /// The picture is retained until it is queued for display and, if `reference` is set, until
    /// [`Self::release_reference`] is called for it.
    pub fn mark_decoded(
        &mut self,
        id: SurfaceId,
        backing: &Bo,
        reference: bool,
    ) -> Result<(), SurfaceError> {
        let entry = self
            .surfaces
            .get_mut(&id)
            .ok_or(SurfaceError::UnknownSurface(id))?;

        entry.reference_hold = reference.then(|| backing.clone());
        entry.display_hold = Some(backing.clone());

        Ok(())
    }

    /// Drops the hold taken by [`Self::mark_decoded`] for reference use.
    pub fn release_reference(&mut self, id: SurfaceId) {
        if let Some(entry) = self.surfaces.get_mut(&id) {
            entry.reference_hold = None;
        }
    }

    /// Drops the reference holds of every surface.
    pub fn release_all_references(&mut self) {
        for entry in self.surfaces.values_mut() {
            entry.reference_hold = None;
        }
    }

    /// Hands the picture of `id` over to the display path.
    pub fn take_for_display(&mut self, id: SurfaceId) -> Result<Bo, SurfaceError> {
        let entry = self
            .surfaces
            .get_mut(&id)
            .ok_or(SurfaceError::UnknownSurface(id))?;

        entry
            .display_hold
            .take()
            .or_else(|| entry.backing.upgrade())
            .ok_or(SurfaceError::NoContent(id))
    }
}

/// Pictures waiting to be displayed, in presentation order.
///
/// The queue retains the backing memory of its pictures, so a picture dropped from the reference
/// table stays alive until it has been displayed.
#[derive(Default)]
pub struct DisplayQueue {
    pictures: VecDeque<(SurfaceId, Bo)>,
}

impl DisplayQueue {
    pub fn push(&mut self, id: SurfaceId, backing: Bo) {
        self.pictures.push_back((id, backing));
    }

    /// Removes the next picture. Its memory is released once the caller drops it, unless still
    /// referenced.
    pub fn pop(&mut self) -> Option<(SurfaceId, Bo)> {
        self.pictures.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pictures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pictures.is_empty()
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.pictures.iter().any(|(p, _)| *p == id)
    }
}

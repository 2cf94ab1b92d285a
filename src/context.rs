// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A decode context: everything needed to turn one frame's worth of work into submitted batches.

use std::rc::Rc;

use thiserror::Error;

use crate::backend::Kernel;
use crate::batch::BatchError;
use crate::batch::CommandBuffer;
use crate::bo::Bo;
use crate::config::Config;
use crate::config::ConfigError;
use crate::hw::Capabilities;
use crate::pipeline::PipelineProgram;
use crate::pipeline::PipelineProgrammer;
use crate::pipeline::ProgramError;
use crate::pipeline::ProgramStats;
use crate::reference::PositionTable;
use crate::reference::ReferenceSlotAllocator;
use crate::reference::SlotError;
use crate::surface::DisplayQueue;
use crate::surface::SurfaceError;
use crate::surface::SurfaceId;
use crate::surface::SurfaceTable;
use crate::Resolution;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Program(#[from] ProgramError),
}

/// What a pipeline program needs to know about the frame it encodes commands for.
pub struct FrameSetup {
    /// Backing memory of the picture being decoded.
    pub target: Bo,
    /// Backing memory of the reference pictures, indexed by frame store id.
    pub references: Vec<Option<Bo>>,
    pub positions: PositionTable<SurfaceId>,
}

/// Result of [`DecodeContext::decode_picture`].
#[derive(Debug)]
pub struct DecodedPicture {
    pub surface: SurfaceId,
    /// Retains the decoded picture for as long as the caller needs it.
    pub backing: Bo,
    pub stats: ProgramStats,
}

pub struct DecodeContext {
    config: Config,
    caps: &'static dyn Capabilities,
    batch: CommandBuffer,
    surfaces: SurfaceTable,
    references: ReferenceSlotAllocator<SurfaceId, Bo>,
    display: DisplayQueue,
    programmer: PipelineProgrammer,
}

impl DecodeContext {
    pub fn new(kernel: Rc<dyn Kernel>, config: Config) -> Result<Self, ContextError> {
        config.validate()?;

        log::debug!(
            "creating {} decode context: {} byte batches, {} reference slots",
            config.generation,
            config.batch_size,
            config.reference_slots
        );

        Ok(Self {
            caps: config.capabilities(),
            batch: CommandBuffer::new(Rc::clone(&kernel), &config)?,
            surfaces: SurfaceTable::new(kernel),
            references: ReferenceSlotAllocator::new(config.reference_slots),
            display: Default::default(),
            programmer: PipelineProgrammer::new(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn capabilities(&self) -> &'static dyn Capabilities {
        self.caps
    }

    pub fn batch(&self) -> &CommandBuffer {
        &self.batch
    }

    pub fn surfaces(&self) -> &SurfaceTable {
        &self.surfaces
    }

    pub fn references(&self) -> &ReferenceSlotAllocator<SurfaceId, Bo> {
        &self.references
    }

    pub fn display(&self) -> &DisplayQueue {
        &self.display
    }

    pub fn programmer(&self) -> &PipelineProgrammer {
        &self.programmer
    }

    pub fn create_surfaces(&mut self, resolution: Resolution, count: usize) -> Vec<SurfaceId> {
        self.surfaces.create_surfaces(resolution, count)
    }

    /// Destroys `id`. Its memory survives while the reference table or the display queue hold it.
    pub fn destroy_surface(&mut self, id: SurfaceId) -> Result<(), ContextError> {
        Ok(self.surfaces.destroy_surface(id)?)
    }

    /// Decodes one picture into `target`.
    ///
    /// The reference table is updated for `reference_set` first, then `make_program` builds the
    /// codec program from the resulting frame setup and `units` are programmed and submitted.
    ///
    /// The decoded picture is retained by the context until it has been queued for display and,
    /// if `reference` is set, until a later frame no longer references it.
    ///
    /// On error the context must be [reset](Self::reset) before decoding again.
    pub fn decode_picture<P, F>(
        &mut self,
        target: SurfaceId,
        reference: bool,
        reference_set: &[SurfaceId],
        units: &[P::Unit],
        make_program: F,
    ) -> Result<DecodedPicture, ContextError>
    where
        P: PipelineProgram,
        F: FnOnce(FrameSetup) -> P,
    {
        let backing = self.surfaces.ensure_backing(target)?;

        let previous: Vec<SurfaceId> = self
            .references
            .slots()
            .flatten()
            .map(|s| s.identity())
            .collect();

        let surfaces = &mut self.surfaces;
        let positions = self.references.run_once_per_frame(reference_set, |id| {
            surfaces.ensure_backing(id).map_err(anyhow::Error::from)
        });

        for id in previous {
            if self.references.frame_store_id(id).is_none() {
                self.surfaces.release_reference(id);
            }
        }
        let positions = positions?;

        self.surfaces.mark_decoded(target, &backing, reference)?;

        let references = self
            .references
            .slots()
            .map(|slot| slot.map(|s| s.resource().clone()))
            .collect();

        let mut program = make_program(FrameSetup {
            target: backing.clone(),
            references,
            positions,
        });

        let stats = self.programmer.run(&mut self.batch, &mut program, units)?;

        log::debug!(
            "decoded {:?} with {} references in {} batches",
            target,
            self.references.occupied(),
            stats.flushes
        );

        Ok(DecodedPicture {
            surface: target,
            backing,
            stats,
        })
    }

    /// Queues `id` for display. The picture stays alive until [`Self::release_displayed`] returns
    /// it, whatever happens to the reference table meanwhile.
    pub fn put_surface(&mut self, id: SurfaceId) -> Result<(), ContextError> {
        let backing = self.surfaces.take_for_display(id)?;

        self.display.push(id, backing);
        Ok(())
    }

    /// Marks the oldest queued picture as displayed and releases the queue's hold on it.
    pub fn release_displayed(&mut self) -> Option<SurfaceId> {
        self.display.pop().map(|(id, _)| id)
    }

    /// Starts over after an error: the pending commands are discarded, the reference table is
    /// emptied and decoded pictures stop being retained as references. Pictures queued or
    /// waiting for display are kept.
    pub fn reset(&mut self) -> Result<(), ContextError> {
        log::debug!("resetting decode context");

        self.batch.reset()?;
        self.references.clear();
        self.surfaces.release_all_references();

        Ok(())
    }
}

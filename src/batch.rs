// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GPU command buffers.
//!
//! A [`CommandBuffer`] accumulates command words for one execution ring, together with the
//! [relocations](relocation::Relocation) needed to patch the addresses of the memory objects it
//! references. Once full, or when explicitly asked to, it is terminated, handed to the kernel and
//! replaced by a fresh buffer.
//!
//! Sequences that must not be split across two submissions are bracketed by
//! [`CommandBuffer::begin_atomic`] and [`CommandBuffer::end_atomic`]: opening the region
//! guarantees enough contiguous space, and any attempt to flush while it is open is refused.

pub mod dump;
pub mod relocation;

use std::rc::Rc;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::Fence;
use crate::backend::Kernel;
use crate::backend::Ring;
use crate::bo::Bo;
use crate::config::Config;
use crate::config::ConfigError;
use crate::hw::Capabilities;
use crate::hw::MI_BATCH_BUFFER_END;
use crate::hw::MI_NOOP;

pub use relocation::Relocation;
pub use relocation::RelocationTable;

const BATCH_ALIGNMENT: usize = 0x1000;

/// Error returned by [`CommandBuffer`] methods.
///
/// None of these is recoverable: they denote either a misconfiguration, a logic error in the
/// code building commands, or a kernel failure. The buffer must be [reset](CommandBuffer::reset)
/// before it can be used again.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("reservation of {requested} words exceeds the batch capacity of {capacity} words")]
    OversizedReservation { requested: usize, capacity: usize },
    #[error("{requested} words do not fit in the open atomic region ({available} words free)")]
    AtomicOverflow { requested: usize, available: usize },
    #[error("batch is already in an atomic region")]
    AtomicReentry,
    #[error("batch is not in an atomic region")]
    AtomicNotOpen,
    #[error("batch cannot be flushed inside an atomic region")]
    FlushInAtomic,
    #[error("write past the end of the batch")]
    Overrun,
    #[error("a packet is already open")]
    PacketOpen,
    #[error("no packet is open")]
    NoPacketOpen,
    #[error("packet declared {expected} words but {emitted} were emitted")]
    PacketLength { expected: usize, emitted: usize },
    #[error("{0:?} ring is not available on this GPU")]
    UnsupportedRing(Ring),
    #[error("write domain {write:#x} is not a single domain among {read:#x}")]
    InvalidDomains { read: u32, write: u32 },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, BatchError>;

#[derive(Clone, Copy, Debug)]
struct Packet {
    start: usize,
    len: usize,
}

/// A batch of GPU commands being built.
pub struct CommandBuffer {
    kernel: Rc<dyn Kernel>,
    caps: &'static dyn Capabilities,
    /// Kernel object the batch is uploaded to on flush.
    bo: Bo,
    /// Size of the batch in words.
    size: usize,
    /// Words at the end of the batch reserved for the termination.
    reserved: usize,
    /// CPU view of the mapped batch. Its length is the write cursor.
    words: Vec<u32>,
    relocations: RelocationTable,
    atomic: bool,
    ring: Ring,
    packet: Option<Packet>,
    flushes: usize,
    last_fence: Option<Fence>,
}

impl CommandBuffer {
    /// Creates a command buffer submitting to `kernel` with the sizes given in `config`.
    pub fn new(kernel: Rc<dyn Kernel>, config: &Config) -> Result<Self> {
        config.validate()?;

        let size = config.batch_words();
        let bo = Self::alloc_batch(&kernel, size)?;

        Ok(Self {
            kernel,
            caps: config.capabilities(),
            bo,
            size,
            reserved: config.reserved_words(),
            words: Vec::with_capacity(size),
            relocations: Default::default(),
            atomic: false,
            ring: Ring::Render,
            packet: None,
            flushes: 0,
            last_fence: None,
        })
    }

    fn alloc_batch(kernel: &Rc<dyn Kernel>, size: usize) -> Result<Bo> {
        let bo = Bo::alloc(kernel, "batch buffer", size * 4, BATCH_ALIGNMENT)?;
        bo.map()?;
        Ok(bo)
    }

    /// Discards the current contents and starts over with a fresh kernel object.
    ///
    /// The previous object is released, but the kernel keeps it alive until the GPU is done with
    /// it if it has been submitted.
    pub fn reset(&mut self) -> Result<()> {
        self.words.clear();
        self.relocations.clear();
        self.atomic = false;
        self.packet = None;
        self.bo = Self::alloc_batch(&self.kernel, self.size)?;

        Ok(())
    }

    /// Number of words commands can use in an empty batch.
    pub fn capacity(&self) -> usize {
        self.size - self.reserved
    }

    /// Number of words written so far.
    pub fn used(&self) -> usize {
        self.words.len()
    }

    pub fn free_space(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Whether `words` more words fit without flushing.
    pub fn check_free_space(&self, words: usize) -> bool {
        self.free_space() >= words
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    /// The words written since the last flush.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn relocations(&self) -> &RelocationTable {
        &self.relocations
    }

    /// Number of batches submitted by this buffer.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Completion handle of the last submitted batch.
    pub fn last_fence(&self) -> Option<Fence> {
        self.last_fence
    }

    pub fn capabilities(&self) -> &'static dyn Capabilities {
        self.caps
    }

    /// Makes sure `words` words can be written, flushing the current batch if needed.
    pub fn reserve(&mut self, words: usize) -> Result<()> {
        if words > self.capacity() {
            return Err(BatchError::OversizedReservation {
                requested: words,
                capacity: self.capacity(),
            });
        }

        if !self.check_free_space(words) {
            if self.atomic {
                return Err(BatchError::AtomicOverflow {
                    requested: words,
                    available: self.free_space(),
                });
            }

            log::debug!(
                "batch full ({} of {} words used), flushing to make room for {}",
                self.used(),
                self.capacity(),
                words
            );
            self.flush()?;
        }

        Ok(())
    }

    pub fn write(&mut self, word: u32) -> Result<()> {
        if self.free_space() == 0 {
            return Err(BatchError::Overrun);
        }

        self.words.push(word);
        Ok(())
    }

    /// Writes the address of `target` plus `delta`, to be fixed up by the kernel at submission.
    pub fn write_with_relocation(
        &mut self,
        target: &Bo,
        read_domains: u32,
        write_domain: u32,
        delta: u32,
    ) -> Result<()> {
        if write_domain != 0
            && (write_domain.count_ones() != 1 || read_domains & write_domain == 0)
        {
            return Err(BatchError::InvalidDomains {
                read: read_domains,
                write: write_domain,
            });
        }

        if self.free_space() == 0 {
            return Err(BatchError::Overrun);
        }

        let presumed = target.presumed_offset()?;
        self.relocations.push(Relocation {
            offset: self.used() * 4,
            target: target.clone(),
            read_domains,
            write_domain,
            delta,
        });

        self.write((presumed as u32).wrapping_add(delta))
    }

    /// Copies `data` into the batch, flushing first if it does not fit.
    pub fn write_data(&mut self, data: &[u32]) -> Result<()> {
        self.reserve(data.len())?;
        self.words.extend_from_slice(data);
        Ok(())
    }

    /// Switches to `ring`. Commands pending for another ring are flushed first.
    pub fn select_ring(&mut self, ring: Ring) -> Result<()> {
        if !self.caps.has_ring(ring) {
            return Err(BatchError::UnsupportedRing(ring));
        }

        if ring != self.ring {
            log::debug!("switching from {:?} to {:?} ring", self.ring, ring);
            self.flush()?;
            self.ring = ring;
        }

        Ok(())
    }

    /// Opens an atomic region with at least `min_size` contiguous words available.
    pub fn begin_atomic(&mut self, min_size: usize) -> Result<()> {
        if self.atomic {
            return Err(BatchError::AtomicReentry);
        }

        self.reserve(min_size)?;
        self.atomic = true;

        Ok(())
    }

    /// Selects `ring` and opens an atomic region on it.
    pub fn begin_atomic_on(&mut self, ring: Ring, min_size: usize) -> Result<()> {
        if self.atomic {
            return Err(BatchError::AtomicReentry);
        }

        self.select_ring(ring)?;
        self.begin_atomic(min_size)
    }

    pub fn end_atomic(&mut self) -> Result<()> {
        if !self.atomic {
            return Err(BatchError::AtomicNotOpen);
        }

        self.atomic = false;
        Ok(())
    }

    /// Starts a packet of exactly `len` words, which are guaranteed to land in the same batch.
    pub fn begin_packet(&mut self, len: usize) -> Result<()> {
        if self.packet.is_some() {
            return Err(BatchError::PacketOpen);
        }

        self.reserve(len)?;
        self.packet = Some(Packet {
            start: self.used(),
            len,
        });

        Ok(())
    }

    /// Closes the current packet, checking that its declared length was honored.
    pub fn advance_packet(&mut self) -> Result<()> {
        let packet = self.packet.take().ok_or(BatchError::NoPacketOpen)?;
        let emitted = self.used() - packet.start;

        if emitted != packet.len {
            return Err(BatchError::PacketLength {
                expected: packet.len,
                emitted,
            });
        }

        Ok(())
    }

    /// Emits the cache flush packet of the current ring.
    pub fn emit_mi_flush(&mut self) -> Result<()> {
        let packet = self.caps.flush_packet(self.ring);

        self.begin_packet(packet.len())?;
        for word in packet {
            self.write(word)?;
        }
        self.advance_packet()
    }

    /// Terminates the batch and submits it to the kernel, then starts a new one.
    ///
    /// Does nothing if the batch is empty. Returns as soon as the kernel has queued the batch;
    /// the GPU may still be reading it.
    pub fn flush(&mut self) -> Result<()> {
        if self.atomic {
            return Err(BatchError::FlushInAtomic);
        }
        if self.packet.is_some() {
            return Err(BatchError::PacketOpen);
        }
        if self.words.is_empty() {
            return Ok(());
        }

        // The batch length must be a multiple of 8 bytes once terminated.
        if self.words.len() % 2 == 0 {
            self.words.push(MI_NOOP);
        }
        self.words.push(MI_BATCH_BUFFER_END);

        let mut bytes = vec![0u8; self.words.len() * 4];
        LittleEndian::write_u32_into(&self.words, &mut bytes);

        self.bo.write(0, &bytes)?;
        self.bo.unmap()?;

        dump::dump(&self.words);
        let fence = self.kernel.submit(
            self.bo.handle(),
            bytes.len(),
            &self.relocations.entries(),
            self.ring,
        )?;

        log::debug!(
            "submitted batch {:?} on {:?}: {} words, {} relocations",
            fence,
            self.ring,
            self.words.len(),
            self.relocations.len()
        );

        self.flushes += 1;
        self.last_fence = Some(fence);
        self.reset()
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The control loop shared by every codec pipeline.
//!
//! A codec pipeline programs the hardware with a block of fixed state (pipe mode, surfaces,
//! scratch buffers, picture parameters) followed by one command per unit of work (slice,
//! macroblock row...). The hardware keeps no configuration across batches, so when the batch runs
//! out of room in the middle of a frame, [`PipelineProgrammer`] closes the atomic region,
//! flushes, opens a new region and emits the fixed state again before resuming with the unit that
//! did not fit.
//!
//! The codec-specific packet encoding is provided through the [`PipelineProgram`] trait.

use std::fmt;

use thiserror::Error;

use crate::backend::Ring;
use crate::batch::BatchError;
use crate::batch::CommandBuffer;

/// Codec-specific part of a pipeline.
pub trait PipelineProgram {
    /// A unit of work, emitted as one command.
    type Unit;

    /// Ring the pipeline runs on.
    fn ring(&self) -> Ring {
        Ring::Bsd
    }

    /// Minimum contiguous space, in words, requested when opening an atomic region.
    fn region_size(&self) -> usize;

    /// Emits the fixed state that must start every region.
    fn emit_state(&mut self, batch: &mut CommandBuffer) -> anyhow::Result<()>;

    /// Exact number of words `emit_unit` will write for `unit`.
    fn unit_size(&self, unit: &Self::Unit) -> usize;

    fn emit_unit(&mut self, batch: &mut CommandBuffer, unit: &Self::Unit) -> anyhow::Result<()>;

    /// Exact number of words `finalize` will write.
    fn finalize_size(&self) -> usize {
        0
    }

    /// Emits the commands closing the frame, e.g. a phantom slice.
    fn finalize(&mut self, _batch: &mut CommandBuffer) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Steps of [`PipelineProgrammer::run`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProgrammerState {
    Init,
    EmitState,
    EmitUnits,
    CloseRegion,
    Flush,
    ReopenRegion,
    Finalize,
    Submit,
}

impl fmt::Display for ProgrammerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgrammerState::Init => "INIT",
            ProgrammerState::EmitState => "EMIT_STATE",
            ProgrammerState::EmitUnits => "EMIT_UNITS",
            ProgrammerState::CloseRegion => "CLOSE_REGION",
            ProgrammerState::Flush => "FLUSH",
            ProgrammerState::ReopenRegion => "REOPEN_REGION",
            ProgrammerState::Finalize => "FINALIZE",
            ProgrammerState::Submit => "SUBMIT",
        };

        f.write_str(name)
    }
}

/// Error returned by [`PipelineProgrammer::run`].
///
/// The command stream is unusable after any of these and the batch must be reset.
#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("{what} needs {size} words but only {available} are left after the fixed state")]
    UnitTooLarge {
        what: String,
        size: usize,
        available: usize,
    },
    #[error("{what} declared {declared} words but emitted {emitted}")]
    SizeMismatch {
        what: String,
        declared: usize,
        emitted: usize,
    },
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Program(#[from] anyhow::Error),
}

/// What a run of the programmer did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgramStats {
    /// Work units emitted.
    pub units: usize,
    /// Atomic regions opened, i.e. number of times the fixed state was emitted.
    pub regions: usize,
    /// Batches submitted, including the final one.
    pub flushes: usize,
}

/// Runs [`PipelineProgram`]s against a command buffer.
#[derive(Debug)]
pub struct PipelineProgrammer {
    state: ProgrammerState,
    transitions: Vec<ProgrammerState>,
    /// Words taken by the fixed state at the start of the current region.
    state_size: usize,
}

impl Default for PipelineProgrammer {
    fn default() -> Self {
        Self {
            state: ProgrammerState::Init,
            transitions: Vec::new(),
            state_size: 0,
        }
    }
}

impl PipelineProgrammer {
    pub fn new() -> Self {
        Default::default()
    }

    /// The state reached by the last run.
    pub fn state(&self) -> ProgrammerState {
        self.state
    }

    /// Every state visited by the last run, in order.
    pub fn transitions(&self) -> &[ProgrammerState] {
        &self.transitions
    }

    fn enter(&mut self, state: ProgrammerState) {
        log::trace!("pipeline {} -> {}", self.state, state);
        self.state = state;
        self.transitions.push(state);
    }

    fn open_region<P: PipelineProgram>(
        &mut self,
        batch: &mut CommandBuffer,
        program: &mut P,
        stats: &mut ProgramStats,
    ) -> Result<(), ProgramError> {
        batch.begin_atomic_on(program.ring(), program.region_size())?;
        stats.regions += 1;

        self.enter(ProgrammerState::EmitState);
        let start = batch.used();
        program.emit_state(batch)?;
        self.state_size = batch.used().saturating_sub(start);

        Ok(())
    }

    /// Makes room for `size` words, moving to a new region if the current one is full.
    fn ensure_space<P: PipelineProgram>(
        &mut self,
        batch: &mut CommandBuffer,
        program: &mut P,
        stats: &mut ProgramStats,
        size: usize,
        what: impl FnOnce() -> String,
    ) -> Result<(), ProgramError> {
        if batch.check_free_space(size) {
            return Ok(());
        }

        // Nothing gained by flushing if a fresh region cannot hold it either.
        let available = batch.capacity().saturating_sub(self.state_size);
        if size > available {
            return Err(ProgramError::UnitTooLarge {
                what: what(),
                size,
                available,
            });
        }

        self.enter(ProgrammerState::CloseRegion);
        batch.end_atomic()?;

        self.enter(ProgrammerState::Flush);
        batch.flush()?;
        stats.flushes += 1;

        self.enter(ProgrammerState::ReopenRegion);
        log::debug!(
            "batch full after {} units, re-emitting state in a new region",
            stats.units
        );
        self.open_region(batch, program, stats)?;

        if !batch.check_free_space(size) {
            return Err(ProgramError::UnitTooLarge {
                what: what(),
                size,
                available: batch.free_space(),
            });
        }

        Ok(())
    }

    /// Programs one frame: fixed state, then each of `units`, then the closing commands, and
    /// submits the result.
    pub fn run<P: PipelineProgram>(
        &mut self,
        batch: &mut CommandBuffer,
        program: &mut P,
        units: &[P::Unit],
    ) -> Result<ProgramStats, ProgramError> {
        let mut stats = ProgramStats::default();

        self.transitions.clear();
        self.state = ProgrammerState::Init;
        self.transitions.push(ProgrammerState::Init);

        self.open_region(batch, program, &mut stats)?;

        self.enter(ProgrammerState::EmitUnits);
        for (index, unit) in units.iter().enumerate() {
            let size = program.unit_size(unit);
            let what = || format!("work unit {}", index);

            if !batch.check_free_space(size) {
                self.ensure_space(batch, program, &mut stats, size, what)?;
                self.enter(ProgrammerState::EmitUnits);
            }

            let start = batch.used();
            program.emit_unit(batch, unit)?;
            check_emitted(what, size, start, batch)?;
            stats.units += 1;
        }

        self.enter(ProgrammerState::Finalize);
        let size = program.finalize_size();
        let what = || "frame finalization".to_string();
        self.ensure_space(batch, program, &mut stats, size, what)?;
        let start = batch.used();
        program.finalize(batch)?;
        check_emitted(what, size, start, batch)?;
        batch.end_atomic()?;

        self.enter(ProgrammerState::Submit);
        batch.flush()?;
        stats.flushes += 1;

        log::debug!(
            "programmed {} units in {} regions, {} batches",
            stats.units,
            stats.regions,
            stats.flushes
        );

        Ok(stats)
    }
}

fn check_emitted(
    what: impl FnOnce() -> String,
    declared: usize,
    start: usize,
    batch: &CommandBuffer,
) -> Result<(), ProgramError> {
    // A program flushing behind our back would make `used` smaller than `start`.
    let emitted = batch.used().checked_sub(start);

    if emitted != Some(declared) {
        return Err(ProgramError::SizeMismatch {
            what: what(),
            declared,
            emitted: emitted.unwrap_or(0),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use anyhow::anyhow;

    use super::*;
    use crate::backend::memory::MemoryKernel;
    use crate::config::Config;
    use crate::hw::Generation;
    use crate::hw::MI_BATCH_BUFFER_END;

    const STATE_MARKER: u32 = 0x5757_0000;
    const UNIT_MARKER: u32 = 0x7171_0000;

    /// A program emitting recognizable words: `state_words` words of state and units of
    /// `unit` words each.
    struct TestProgram {
        state_words: usize,
        region_size: usize,
        finalize_words: usize,
        states_emitted: usize,
    }

    impl TestProgram {
        fn new(state_words: usize) -> Self {
            Self {
                state_words,
                region_size: state_words,
                finalize_words: 0,
                states_emitted: 0,
            }
        }
    }

    impl PipelineProgram for TestProgram {
        type Unit = usize;

        fn region_size(&self) -> usize {
            self.region_size
        }

        fn emit_state(&mut self, batch: &mut CommandBuffer) -> anyhow::Result<()> {
            self.states_emitted += 1;
            for i in 0..self.state_words {
                batch.write(STATE_MARKER | i as u32)?;
            }
            Ok(())
        }

        fn unit_size(&self, unit: &usize) -> usize {
            *unit
        }

        fn emit_unit(&mut self, batch: &mut CommandBuffer, unit: &usize) -> anyhow::Result<()> {
            for _ in 0..*unit {
                batch.write(UNIT_MARKER | *unit as u32)?;
            }
            Ok(())
        }

        fn finalize_size(&self) -> usize {
            self.finalize_words
        }

        fn finalize(&mut self, batch: &mut CommandBuffer) -> anyhow::Result<()> {
            for _ in 0..self.finalize_words {
                batch.write(0xf1f1_f1f1)?;
            }
            Ok(())
        }
    }

    fn new_batch(words: usize) -> (Rc<MemoryKernel>, CommandBuffer) {
        let kernel = Rc::new(MemoryKernel::new());
        let config = Config::new(Generation::Gen6).with_batch_words(words);
        let batch = CommandBuffer::new(kernel.clone(), &config).unwrap();

        (kernel, batch)
    }

    fn is_state(word: &u32) -> bool {
        word & 0xffff_0000 == STATE_MARKER
    }

    #[test]
    fn single_region() {
        let (kernel, mut batch) = new_batch(64);
        let mut programmer = PipelineProgrammer::new();
        let mut program = TestProgram::new(10);

        let stats = programmer.run(&mut batch, &mut program, &[4, 4, 4]).unwrap();

        assert_eq!(
            stats,
            ProgramStats {
                units: 3,
                regions: 1,
                flushes: 1
            }
        );
        assert_eq!(programmer.state(), ProgrammerState::Submit);
        assert_eq!(
            programmer.transitions(),
            [
                ProgrammerState::Init,
                ProgrammerState::EmitState,
                ProgrammerState::EmitUnits,
                ProgrammerState::Finalize,
                ProgrammerState::Submit
            ]
        );
        assert!(batch.is_empty());
        assert!(!batch.is_atomic());

        let submissions = kernel.submissions();
        assert_eq!(submissions.len(), 1);
        assert!(submissions[0].words[..10].iter().all(is_state));
    }

    #[test]
    fn state_is_reemitted_after_overflow() {
        let _ = env_logger::try_init();

        // 40 words, of which 36 are usable: 20 of state and two units of 8 fit.
        let (kernel, mut batch) = new_batch(40);
        let mut programmer = PipelineProgrammer::new();
        let mut program = TestProgram::new(20);

        let stats = programmer.run(&mut batch, &mut program, &[8, 8, 8]).unwrap();

        assert_eq!(stats.units, 3);
        assert_eq!(stats.regions, 2);
        assert_eq!(stats.flushes, 2);
        assert_eq!(program.states_emitted, 2);

        let submissions = kernel.submissions();
        assert_eq!(submissions.len(), 2);

        // First batch: state, units 1 and 2, padding and terminator.
        let first = &submissions[0].words;
        assert_eq!(first.len(), 38);
        assert!(first[..20].iter().all(is_state));
        assert!(first[20..36].iter().all(|w| *w == UNIT_MARKER | 8));
        assert_eq!(first[37], MI_BATCH_BUFFER_END);

        // Second batch starts with the state again, then unit 3.
        let second = &submissions[1].words;
        assert!(second[..20].iter().all(is_state));
        assert!(second[20..28].iter().all(|w| *w == UNIT_MARKER | 8));

        assert_eq!(
            programmer.transitions(),
            [
                ProgrammerState::Init,
                ProgrammerState::EmitState,
                ProgrammerState::EmitUnits,
                ProgrammerState::CloseRegion,
                ProgrammerState::Flush,
                ProgrammerState::ReopenRegion,
                ProgrammerState::EmitState,
                ProgrammerState::EmitUnits,
                ProgrammerState::Finalize,
                ProgrammerState::Submit
            ]
        );
    }

    #[test]
    fn every_batch_starts_with_state() {
        let (kernel, mut batch) = new_batch(64);
        let mut programmer = PipelineProgrammer::new();
        let mut program = TestProgram::new(6);
        let units: Vec<usize> = (1..=30).map(|i| i % 7 + 1).collect();

        let stats = programmer.run(&mut batch, &mut program, &units).unwrap();
        assert_eq!(stats.units, units.len());
        assert_eq!(stats.flushes, kernel.submissions().len());
        assert!(stats.regions > 1);

        let mut emitted_units = 0;
        for submission in kernel.submissions().iter() {
            assert!(submission.words[..6].iter().all(is_state));
            assert!(!submission.words[6..].iter().any(is_state));
            emitted_units += submission
                .words
                .iter()
                .filter(|w| *w & 0xffff_0000 == UNIT_MARKER)
                .count();
        }
        assert_eq!(emitted_units, units.iter().sum::<usize>());
    }

    #[test]
    fn command_stream_is_reproducible() {
        let run = || {
            let (kernel, mut batch) = new_batch(48);
            let mut program = TestProgram::new(12);
            PipelineProgrammer::new()
                .run(&mut batch, &mut program, &[5, 9, 3, 11, 7, 2])
                .unwrap();

            let checksums: Vec<u32> = kernel.submissions().iter().map(|s| s.checksum()).collect();
            checksums
        };

        let first = run();
        assert!(first.len() > 1);
        assert_eq!(first, run());
    }

    #[test]
    fn unit_larger_than_empty_batch() {
        let (kernel, mut batch) = new_batch(40);
        let mut programmer = PipelineProgrammer::new();
        let mut program = TestProgram::new(20);

        let err = programmer.run(&mut batch, &mut program, &[8, 17]).unwrap_err();
        assert!(matches!(
            err,
            ProgramError::UnitTooLarge {
                size: 17,
                available: 16,
                ..
            }
        ));
        assert_eq!(programmer.state(), ProgrammerState::EmitUnits);
        // The region holding unit 0 is not submitted for nothing.
        assert!(!programmer.transitions().contains(&ProgrammerState::Flush));
        assert!(kernel.submissions().is_empty());
        assert_eq!(program.states_emitted, 1);
    }

    #[test]
    fn oversized_first_unit_submits_nothing() {
        let (kernel, mut batch) = new_batch(40);
        let mut programmer = PipelineProgrammer::new();
        let mut program = TestProgram::new(20);

        let err = programmer.run(&mut batch, &mut program, &[30]).unwrap_err();
        assert!(matches!(
            err,
            ProgramError::UnitTooLarge {
                size: 30,
                available: 16,
                ..
            }
        ));
        assert!(kernel.submissions().is_empty());
        assert_eq!(program.states_emitted, 1);
    }

    #[test]
    fn finalization_gets_room() {
        let (kernel, mut batch) = new_batch(40);
        let mut programmer = PipelineProgrammer::new();
        let mut program = TestProgram::new(20);
        program.finalize_words = 4;

        let stats = programmer.run(&mut batch, &mut program, &[8, 8]).unwrap();
        assert_eq!(stats.regions, 2);

        let submissions = kernel.submissions();
        let last = &submissions[1].words;
        assert!(last[..20].iter().all(is_state));
        assert_eq!(last[20], 0xf1f1_f1f1);
    }

    #[test]
    fn declared_size_is_enforced() {
        struct Liar;

        impl PipelineProgram for Liar {
            type Unit = ();

            fn region_size(&self) -> usize {
                4
            }

            fn emit_state(&mut self, _: &mut CommandBuffer) -> anyhow::Result<()> {
                Ok(())
            }

            fn unit_size(&self, _: &()) -> usize {
                2
            }

            fn emit_unit(&mut self, batch: &mut CommandBuffer, _: &()) -> anyhow::Result<()> {
                Ok(batch.write(0)?)
            }
        }

        let (_, mut batch) = new_batch(64);
        let err = PipelineProgrammer::new()
            .run(&mut batch, &mut Liar, &[()])
            .unwrap_err();

        assert!(matches!(
            err,
            ProgramError::SizeMismatch {
                declared: 2,
                emitted: 1,
                ..
            }
        ));
    }

    #[test]
    fn regions_can_start_with_cache_flush() {
        struct Flushing;

        impl PipelineProgram for Flushing {
            type Unit = ();

            fn region_size(&self) -> usize {
                8
            }

            fn emit_state(&mut self, batch: &mut CommandBuffer) -> anyhow::Result<()> {
                batch.emit_mi_flush()?;
                Ok(batch.write_data(&[STATE_MARKER; 4])?)
            }

            fn unit_size(&self, _: &()) -> usize {
                6
            }

            fn emit_unit(&mut self, batch: &mut CommandBuffer, _: &()) -> anyhow::Result<()> {
                Ok(batch.write_data(&[UNIT_MARKER; 6])?)
            }
        }

        let (kernel, mut batch) = new_batch(32);
        let stats = PipelineProgrammer::new()
            .run(&mut batch, &mut Flushing, &[(), (), (), ()])
            .unwrap();
        assert_eq!(stats.regions, 2);

        let flush = Generation::Gen6.capabilities().flush_packet(Ring::Bsd);
        for submission in kernel.submissions().iter() {
            assert_eq!(submission.ring, Ring::Bsd);
            assert_eq!(submission.words[..flush.len()], flush[..]);
        }
    }

    #[test]
    fn program_errors_are_propagated() {
        struct Failing;

        impl PipelineProgram for Failing {
            type Unit = ();

            fn region_size(&self) -> usize {
                4
            }

            fn emit_state(&mut self, _: &mut CommandBuffer) -> anyhow::Result<()> {
                Err(anyhow!("missing picture parameters"))
            }

            fn unit_size(&self, _: &()) -> usize {
                0
            }

            fn emit_unit(&mut self, _: &mut CommandBuffer, _: &()) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let (_, mut batch) = new_batch(64);
        let err = PipelineProgrammer::new()
            .run(&mut batch, &mut Failing, &[()])
            .unwrap_err();

        assert!(matches!(err, ProgramError::Program(_)));
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Engine configuration, resolved once when a context is created.

use thiserror::Error;

use crate::hw::Capabilities;
use crate::hw::Generation;

/// Default size of a batch buffer, in bytes.
pub const BATCH_SIZE: usize = 0x10000;
/// Bytes kept free at the end of every batch for the padding word and the termination marker.
pub const BATCH_RESERVED: usize = 0x10;

/// Smallest reserve able to hold the padding word and `MI_BATCH_BUFFER_END`.
const MIN_RESERVED_WORDS: usize = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported PCI device id {0:#06x}")]
    UnsupportedDevice(u16),
    #[error("{0} bytes is not a whole number of command words")]
    Misaligned(usize),
    #[error("batch of {size} bytes cannot hold the {reserved} reserved bytes and a command")]
    BatchTooSmall { size: usize, reserved: usize },
    #[error("reserved area of {0} bytes cannot hold the batch termination")]
    ReservedTooSmall(usize),
    #[error("at least one reference slot is required")]
    NoReferenceSlots,
}

/// Configuration of the command engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub generation: Generation,
    /// Size of each batch buffer in bytes.
    pub batch_size: usize,
    /// Bytes at the end of each batch that commands may not use.
    pub batch_reserved: usize,
    /// Number of reference slots (hardware frame stores) of the decode pipelines.
    pub reference_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Generation::Gen6)
    }
}

impl Config {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            batch_size: BATCH_SIZE,
            batch_reserved: BATCH_RESERVED,
            reference_slots: generation.capabilities().avc_frame_stores(),
        }
    }

    /// Resolves the configuration of the GPU with PCI id `device_id`.
    pub fn from_device_id(device_id: u16) -> Result<Self, ConfigError> {
        Generation::from_device_id(device_id)
            .map(Self::new)
            .ok_or(ConfigError::UnsupportedDevice(device_id))
    }

    /// Sets the batch size, expressed in command words.
    pub fn with_batch_words(mut self, words: usize) -> Self {
        self.batch_size = words * 4;
        self
    }

    pub fn with_reserved_words(mut self, words: usize) -> Self {
        self.batch_reserved = words * 4;
        self
    }

    pub fn with_reference_slots(mut self, slots: usize) -> Self {
        self.reference_slots = slots;
        self
    }

    pub fn batch_words(&self) -> usize {
        self.batch_size / 4
    }

    pub fn reserved_words(&self) -> usize {
        self.batch_reserved / 4
    }

    pub fn capabilities(&self) -> &'static dyn Capabilities {
        self.generation.capabilities()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for bytes in [self.batch_size, self.batch_reserved] {
            if bytes % 4 != 0 {
                return Err(ConfigError::Misaligned(bytes));
            }
        }

        if self.reserved_words() < MIN_RESERVED_WORDS {
            return Err(ConfigError::ReservedTooSmall(self.batch_reserved));
        }

        if self.batch_words() <= self.reserved_words() {
            return Err(ConfigError::BatchTooSmall {
                size: self.batch_size,
                reserved: self.batch_reserved,
            });
        }

        if self.reference_slots == 0 {
            return Err(ConfigError::NoReferenceSlots);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_device_id(0x0126).unwrap();
        assert_eq!(config.generation, Generation::Gen6);
        assert_eq!(config.batch_words(), 0x4000);
        assert_eq!(config.reserved_words(), 4);
        assert_eq!(config.reference_slots, 16);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn unknown_device() {
        assert_eq!(
            Config::from_device_id(0xffff),
            Err(ConfigError::UnsupportedDevice(0xffff))
        );
    }

    #[test]
    fn invalid_configs() {
        let base = Config::new(Generation::Gen7);

        let mut misaligned = base.clone();
        misaligned.batch_size = 0x1002;
        assert_eq!(misaligned.validate(), Err(ConfigError::Misaligned(0x1002)));

        assert_eq!(
            base.clone().with_batch_words(4).validate(),
            Err(ConfigError::BatchTooSmall {
                size: 16,
                reserved: 16
            })
        );
        assert_eq!(
            base.clone().with_reserved_words(1).validate(),
            Err(ConfigError::ReservedTooSmall(4))
        );
        assert_eq!(
            base.with_reference_slots(0).validate(),
            Err(ConfigError::NoReferenceSlots)
        );
    }
}

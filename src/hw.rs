// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware generation detection and per-generation capability tables.
//!
//! The generation of the GPU is resolved exactly once, when a [`Config`](crate::config::Config)
//! is built, and every generation-dependent decision afterwards goes through the
//! [`Capabilities`] trait object returned by [`Generation::capabilities`]. Nothing downstream
//! inspects the PCI device id again.

use std::fmt;
use std::str::FromStr;

use enumn::N;

use crate::backend::Ring;

const CMD_MI: u32 = 0x0 << 29;

pub const MI_NOOP: u32 = CMD_MI;
pub const MI_FLUSH: u32 = CMD_MI | (0x4 << 23);
pub const MI_BATCH_BUFFER_END: u32 = CMD_MI | (0xa << 23);
pub const MI_FLUSH_DW: u32 = CMD_MI | (0x26 << 23) | 0x2;

pub const MI_FLUSH_STATE_INSTRUCTION_CACHE_INVALIDATE: u32 = 0x1 << 0;
pub const MI_FLUSH_DW_VIDEO_PIPELINE_CACHE_INVALIDATE: u32 = 0x1 << 7;

/// Builds a 3D/media pipeline command header.
pub const fn gfx_cmd(pipeline: u32, op: u32, sub_op: u32) -> u32 {
    (3 << 29) | (pipeline << 27) | (op << 24) | (sub_op << 16)
}

pub const CMD_PIPE_CONTROL: u32 = gfx_cmd(3, 2, 0);
pub const CMD_PIPE_CONTROL_NOWRITE: u32 = 0 << 14;
pub const CMD_PIPE_CONTROL_WC_FLUSH: u32 = 1 << 12;
pub const CMD_PIPE_CONTROL_TC_FLUSH: u32 = 1 << 10;
pub const CMD_PIPE_CONTROL_DC_FLUSH: u32 = 1 << 5;

const PCI_CHIP_GM45_GM: u16 = 0x2a42;
const PCI_CHIP_IGD_E_G: u16 = 0x2e02;
const PCI_CHIP_Q45_G: u16 = 0x2e12;
const PCI_CHIP_G45_G: u16 = 0x2e22;
const PCI_CHIP_G41_G: u16 = 0x2e32;

const PCI_CHIP_IRONLAKE_D_G: u16 = 0x0042;
const PCI_CHIP_IRONLAKE_M_G: u16 = 0x0046;

const PCI_CHIP_SANDYBRIDGE_GT1: u16 = 0x0102;
const PCI_CHIP_SANDYBRIDGE_GT2: u16 = 0x0112;
const PCI_CHIP_SANDYBRIDGE_GT2_PLUS: u16 = 0x0122;
const PCI_CHIP_SANDYBRIDGE_M_GT1: u16 = 0x0106;
const PCI_CHIP_SANDYBRIDGE_M_GT2: u16 = 0x0116;
const PCI_CHIP_SANDYBRIDGE_M_GT2_PLUS: u16 = 0x0126;
const PCI_CHIP_SANDYBRIDGE_S_GT: u16 = 0x010a;

const PCI_CHIP_IVYBRIDGE_GT1: u16 = 0x0152;
const PCI_CHIP_IVYBRIDGE_GT2: u16 = 0x0162;
const PCI_CHIP_IVYBRIDGE_M_GT1: u16 = 0x0156;
const PCI_CHIP_IVYBRIDGE_M_GT2: u16 = 0x0166;
const PCI_CHIP_IVYBRIDGE_S_GT1: u16 = 0x015a;
const PCI_CHIP_IVYBRIDGE_S_GT2: u16 = 0x016a;

/// A supported GPU generation.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Generation {
    /// G45/GM45/G41 family.
    Gen4 = 4,
    /// Ironlake.
    Gen5 = 5,
    /// Sandybridge.
    Gen6 = 6,
    /// Ivybridge.
    Gen7 = 7,
}

impl Generation {
    /// Resolves the generation of the GPU with PCI id `device_id`.
    pub fn from_device_id(device_id: u16) -> Option<Self> {
        match device_id {
            PCI_CHIP_GM45_GM | PCI_CHIP_IGD_E_G | PCI_CHIP_Q45_G | PCI_CHIP_G45_G
            | PCI_CHIP_G41_G => Some(Generation::Gen4),
            PCI_CHIP_IRONLAKE_D_G | PCI_CHIP_IRONLAKE_M_G => Some(Generation::Gen5),
            PCI_CHIP_SANDYBRIDGE_GT1
            | PCI_CHIP_SANDYBRIDGE_GT2
            | PCI_CHIP_SANDYBRIDGE_GT2_PLUS
            | PCI_CHIP_SANDYBRIDGE_M_GT1
            | PCI_CHIP_SANDYBRIDGE_M_GT2
            | PCI_CHIP_SANDYBRIDGE_M_GT2_PLUS
            | PCI_CHIP_SANDYBRIDGE_S_GT => Some(Generation::Gen6),
            PCI_CHIP_IVYBRIDGE_GT1
            | PCI_CHIP_IVYBRIDGE_GT2
            | PCI_CHIP_IVYBRIDGE_M_GT1
            | PCI_CHIP_IVYBRIDGE_M_GT2
            | PCI_CHIP_IVYBRIDGE_S_GT1
            | PCI_CHIP_IVYBRIDGE_S_GT2 => Some(Generation::Gen7),
            _ => None,
        }
    }

    /// Returns the capability table of this generation.
    pub fn capabilities(self) -> &'static dyn Capabilities {
        match self {
            Generation::Gen4 => &Gen4,
            Generation::Gen5 => &Gen5,
            Generation::Gen6 => &Gen6,
            Generation::Gen7 => &Gen7,
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", *self as u32)
    }
}

impl FromStr for Generation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("gen")
            .or_else(|| s.strip_prefix("Gen"))
            .or_else(|| s.strip_prefix("GEN"))
            .unwrap_or(s);

        digits
            .parse::<u32>()
            .ok()
            .and_then(Generation::n)
            .ok_or("unrecognized generation. Valid values: gen4, gen5, gen6, gen7")
    }
}

/// Generation-specific behavior of the command engine.
///
/// Implementations are stateless and selected once through [`Generation::capabilities`].
pub trait Capabilities: fmt::Debug {
    fn generation(&self) -> Generation;

    /// Whether `ring` exists on this generation.
    fn has_ring(&self, ring: Ring) -> bool;

    /// Number of frame stores the MFX/BSD hardware can address for AVC decoding.
    fn avc_frame_stores(&self) -> usize {
        16
    }

    /// The words of the cache flush packet for `ring`.
    fn flush_packet(&self, ring: Ring) -> Vec<u32>;
}

#[derive(Debug)]
struct Gen4;

#[derive(Debug)]
struct Gen5;

#[derive(Debug)]
struct Gen6;

#[derive(Debug)]
struct Gen7;

/// Flush packet shared by GEN4 and GEN5, which only have a single-word MI_FLUSH.
fn legacy_flush_packet() -> Vec<u32> {
    vec![MI_FLUSH | MI_FLUSH_STATE_INSTRUCTION_CACHE_INVALIDATE]
}

/// Flush packets of the non-render rings of GEN6 and later.
fn flush_dw_packet(ring: Ring) -> Vec<u32> {
    let header = match ring {
        Ring::Bsd => MI_FLUSH_DW | MI_FLUSH_DW_VIDEO_PIPELINE_CACHE_INVALIDATE,
        _ => MI_FLUSH_DW,
    };

    vec![header, 0, 0, 0]
}

impl Capabilities for Gen4 {
    fn generation(&self) -> Generation {
        Generation::Gen4
    }

    fn has_ring(&self, ring: Ring) -> bool {
        matches!(ring, Ring::Render | Ring::Bsd)
    }

    fn flush_packet(&self, _: Ring) -> Vec<u32> {
        legacy_flush_packet()
    }
}

impl Capabilities for Gen5 {
    fn generation(&self) -> Generation {
        Generation::Gen5
    }

    fn has_ring(&self, ring: Ring) -> bool {
        matches!(ring, Ring::Render | Ring::Bsd)
    }

    fn flush_packet(&self, _: Ring) -> Vec<u32> {
        legacy_flush_packet()
    }
}

impl Capabilities for Gen6 {
    fn generation(&self) -> Generation {
        Generation::Gen6
    }

    fn has_ring(&self, _: Ring) -> bool {
        true
    }

    fn flush_packet(&self, ring: Ring) -> Vec<u32> {
        match ring {
            Ring::Render => vec![
                CMD_PIPE_CONTROL | 0x2,
                CMD_PIPE_CONTROL_WC_FLUSH | CMD_PIPE_CONTROL_TC_FLUSH | CMD_PIPE_CONTROL_NOWRITE,
                0,
                0,
            ],
            _ => flush_dw_packet(ring),
        }
    }
}

impl Capabilities for Gen7 {
    fn generation(&self) -> Generation {
        Generation::Gen7
    }

    fn has_ring(&self, _: Ring) -> bool {
        true
    }

    fn flush_packet(&self, ring: Ring) -> Vec<u32> {
        match ring {
            // GEN7 also needs the data cache flushed.
            Ring::Render => vec![
                CMD_PIPE_CONTROL | 0x2,
                CMD_PIPE_CONTROL_WC_FLUSH
                    | CMD_PIPE_CONTROL_TC_FLUSH
                    | CMD_PIPE_CONTROL_DC_FLUSH
                    | CMD_PIPE_CONTROL_NOWRITE,
                0,
                0,
            ],
            _ => flush_dw_packet(ring),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_from_device_id() {
        assert_eq!(Generation::from_device_id(0x2a42), Some(Generation::Gen4));
        assert_eq!(Generation::from_device_id(0x0046), Some(Generation::Gen5));
        assert_eq!(Generation::from_device_id(0x0116), Some(Generation::Gen6));
        assert_eq!(Generation::from_device_id(0x0166), Some(Generation::Gen7));
        assert_eq!(Generation::from_device_id(0x1234), None);
    }

    #[test]
    fn generation_from_str() {
        assert_eq!("gen6".parse::<Generation>(), Ok(Generation::Gen6));
        assert_eq!("GEN7".parse::<Generation>(), Ok(Generation::Gen7));
        assert_eq!("4".parse::<Generation>(), Ok(Generation::Gen4));
        assert!("gen9".parse::<Generation>().is_err());
        assert!("ironlake".parse::<Generation>().is_err());
    }

    #[test]
    fn capabilities_match_generation() {
        for gen in [
            Generation::Gen4,
            Generation::Gen5,
            Generation::Gen6,
            Generation::Gen7,
        ] {
            assert_eq!(gen.capabilities().generation(), gen);
        }
    }

    #[test]
    fn flush_packets() {
        let gen5 = Generation::Gen5.capabilities();
        assert_eq!(gen5.flush_packet(Ring::Bsd), vec![0x0200_0001]);
        assert!(!gen5.has_ring(Ring::Blt));

        let gen6 = Generation::Gen6.capabilities();
        assert_eq!(gen6.flush_packet(Ring::Render).len(), 4);
        assert_eq!(gen6.flush_packet(Ring::Render)[0], 0x7a00_0002);
        assert_eq!(gen6.flush_packet(Ring::Bsd)[0], 0x1300_0082);
        assert_eq!(gen6.flush_packet(Ring::Blt)[0], 0x1300_0002);

        let gen7 = Generation::Gen7.capabilities();
        assert_ne!(
            gen7.flush_packet(Ring::Render)[1] & CMD_PIPE_CONTROL_DC_FLUSH,
            0
        );
        assert_eq!(
            gen6.flush_packet(Ring::Render)[1] & CMD_PIPE_CONTROL_DC_FLUSH,
            0
        );
    }
}

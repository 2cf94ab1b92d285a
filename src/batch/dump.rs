// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder for the command words the engine emits on its own.
//!
//! Only the MI commands and `PIPE_CONTROL` are named; codec packets are reported by client and
//! length so a dump stays aligned on command boundaries.

use thiserror::Error;

const CLIENT_SHIFT: u32 = 29;
const CLIENT_MI: u32 = 0x0;
const CLIENT_2D: u32 = 0x2;
const CLIENT_GFX: u32 = 0x3;

const MI_OPCODE_SHIFT: u32 = 23;
const MI_OPCODE_MASK: u32 = 0x3f;

const OPCODE_MI_NOOP: u32 = 0x00;
const OPCODE_MI_FLUSH: u32 = 0x04;
const OPCODE_MI_BATCH_BUFFER_END: u32 = 0x0a;
const OPCODE_MI_FLUSH_DW: u32 = 0x26;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{name} at word {offset} needs {len} words but only {available} remain")]
pub struct TruncatedCommand {
    pub name: &'static str,
    pub offset: usize,
    pub len: usize,
    pub available: usize,
}

/// One command found in a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedCommand {
    /// Word offset of the command header.
    pub offset: usize,
    pub name: &'static str,
    /// Length in words, header included.
    pub len: usize,
}

fn decode_one(words: &[u32]) -> (&'static str, usize) {
    let header = words[0];

    match header >> CLIENT_SHIFT {
        CLIENT_MI => match (header >> MI_OPCODE_SHIFT) & MI_OPCODE_MASK {
            OPCODE_MI_NOOP => ("MI_NOOP", 1),
            OPCODE_MI_FLUSH => ("MI_FLUSH", 1),
            OPCODE_MI_BATCH_BUFFER_END => ("MI_BATCH_BUFFER_END", 1),
            OPCODE_MI_FLUSH_DW => ("MI_FLUSH_DW", (header & 0x3f) as usize + 2),
            _ => ("UNKNOWN MI COMMAND", 1),
        },
        CLIENT_GFX if header & 0xffff_0000 == crate::hw::CMD_PIPE_CONTROL => {
            ("PIPE_CONTROL", (header & 0xff) as usize + 2)
        }
        CLIENT_GFX => ("GFX COMMAND", (header & 0xfff) as usize + 2),
        CLIENT_2D => ("2D COMMAND", (header & 0xff) as usize + 2),
        _ => ("UNKNOWN COMMAND", 1),
    }
}

/// Splits `words` into commands.
pub fn decode(words: &[u32]) -> Result<Vec<DecodedCommand>, TruncatedCommand> {
    let mut commands = Vec::new();
    let mut offset = 0;

    while offset < words.len() {
        let (name, len) = decode_one(&words[offset..]);
        let available = words.len() - offset;
        if len > available {
            return Err(TruncatedCommand {
                name,
                offset,
                len,
                available,
            });
        }

        commands.push(DecodedCommand { offset, name, len });
        offset += len;

        if name == "MI_BATCH_BUFFER_END" {
            break;
        }
    }

    Ok(commands)
}

/// Logs the decoded contents of `words` at trace level.
pub fn dump(words: &[u32]) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }

    match decode(words) {
        Ok(commands) => {
            for cmd in commands {
                log::trace!(
                    "{:#010x}: {:#010x}: {} ({} words)",
                    cmd.offset * 4,
                    words[cmd.offset],
                    cmd.name,
                    cmd.len
                );
            }
        }
        Err(e) => log::trace!("cannot dump batch: {}", e),
    }
}

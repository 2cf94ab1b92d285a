// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::backend::RelocationEntry;
use crate::bo::Bo;

/// A command word that must be patched with the final address of `target` at submission.
#[derive(Clone, Debug)]
pub struct Relocation {
    /// Byte offset of the patched word in the batch.
    pub offset: usize,
    /// Kept alive until the batch referencing it has been submitted.
    pub target: Bo,
    pub read_domains: u32,
    pub write_domain: u32,
    pub delta: u32,
}

impl Relocation {
    fn entry(&self) -> RelocationEntry {
        RelocationEntry {
            offset: self.offset,
            target: self.target.handle(),
            read_domains: self.read_domains,
            write_domain: self.write_domain,
            delta: self.delta,
        }
    }
}

/// Pending relocations of a batch, in emission order.
#[derive(Debug, Default)]
pub struct RelocationTable {
    relocations: Vec<Relocation>,
}

impl RelocationTable {
    pub fn push(&mut self, relocation: Relocation) {
        self.relocations.push(relocation);
    }

    pub fn len(&self) -> usize {
        self.relocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relocations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relocation> {
        self.relocations.iter()
    }

    /// Whether any pending relocation points at `bo`.
    pub fn references(&self, bo: &Bo) -> bool {
        self.relocations.iter().any(|r| r.target.ptr_eq(bo))
    }

    /// The kernel view of the table.
    pub fn entries(&self) -> Vec<RelocationEntry> {
        self.relocations.iter().map(Relocation::entry).collect()
    }

    /// Drops all relocations, releasing the targets they retained.
    pub fn clear(&mut self) {
        self.relocations.clear();
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame store assignment for reference pictures.
//!
//! The decode hardware addresses reference pictures through a fixed-width table of frame stores.
//! [`ReferenceSlotAllocator`] keeps that table coherent from one frame to the next: a picture keeps
//! the frame store id it was given for as long as it stays in the reference set, newcomers get the
//! lowest free id, and the table is kept ordered so that position `i` holds frame store `i`.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlotError {
    #[error("{requested} live references exceed the {capacity} available frame stores")]
    TooManyReferences { requested: usize, capacity: usize },
    #[error("cannot obtain backing memory for reference {identity}")]
    Resolve {
        identity: String,
        #[source]
        source: anyhow::Error,
    },
}

/// An occupied entry of the frame store table.
#[derive(Debug)]
pub struct ReferenceSlot<K, R> {
    identity: K,
    frame_store_id: usize,
    /// Keeps the picture's backing memory alive while it is referenced.
    resource: R,
}

impl<K: Copy, R> ReferenceSlot<K, R> {
    pub fn identity(&self) -> K {
        self.identity
    }

    pub fn frame_store_id(&self) -> usize {
        self.frame_store_id
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }
}

/// Maps frame store positions to picture identities, as consumed by the hardware table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionTable<K> {
    entries: Vec<Option<K>>,
}

impl<K: Copy + PartialEq> PositionTable<K> {
    /// The picture held at `position`, if any.
    pub fn get(&self, position: usize) -> Option<K> {
        self.entries.get(position).copied().flatten()
    }

    /// The position of `identity`, if it is referenced.
    pub fn position(&self, identity: K) -> Option<usize> {
        self.entries.iter().position(|e| *e == Some(identity))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of occupied positions.
    pub fn occupied(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<K>> + '_ {
        self.entries.iter().copied()
    }
}

/// Assigns stable frame store ids to the reference pictures of a decode context.
///
/// `K` identifies a picture and `R` is whatever the table must retain for a referenced picture,
/// usually its backing memory.
pub struct ReferenceSlotAllocator<K, R> {
    slots: Vec<Option<ReferenceSlot<K, R>>>,
}

impl<K, R> ReferenceSlotAllocator<K, R>
where
    K: Copy + PartialEq + fmt::Debug,
{
    /// Creates an empty table of `num_slots` frame stores.
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(num_slots).collect(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn slots(&self) -> impl Iterator<Item = Option<&ReferenceSlot<K, R>>> + '_ {
        self.slots.iter().map(Option::as_ref)
    }

    pub fn get(&self, position: usize) -> Option<&ReferenceSlot<K, R>> {
        self.slots.get(position).and_then(Option::as_ref)
    }

    pub fn frame_store_id(&self, identity: K) -> Option<usize> {
        self.find(identity).map(|s| s.frame_store_id)
    }

    fn find(&self, identity: K) -> Option<&ReferenceSlot<K, R>> {
        self.slots.iter().flatten().find(|s| s.identity == identity)
    }

    /// The current position to picture table.
    pub fn position_table(&self) -> PositionTable<K> {
        PositionTable {
            entries: self
                .slots
                .iter()
                .map(|s| s.as_ref().map(|s| s.identity))
                .collect(),
        }
    }

    /// Empties the table, releasing every retained resource.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Updates the table for a new frame whose references are `reference_set`.
    ///
    /// Pictures no longer referenced are evicted and their resource dropped, new references are
    /// admitted with the lowest free frame store id after `resolve` produced their resource, and
    /// the table is reordered so that each picture sits at the position of its frame store id.
    ///
    /// Must be called once per frame, before any command for that frame is emitted.
    pub fn run_once_per_frame<F>(
        &mut self,
        reference_set: &[K],
        mut resolve: F,
    ) -> Result<PositionTable<K>, SlotError>
    where
        F: FnMut(K) -> anyhow::Result<R>,
    {
        let mut references: Vec<K> = Vec::with_capacity(reference_set.len());
        for identity in reference_set {
            if !references.contains(identity) {
                references.push(*identity);
            }
        }

        if references.len() > self.num_slots() {
            return Err(SlotError::TooManyReferences {
                requested: references.len(),
                capacity: self.num_slots(),
            });
        }

        self.evict(&references);
        // A failed admission leaves the pictures admitted so far in place.
        let admitted = self.admit(&references, &mut resolve);
        self.canonicalize();

        debug_assert!(self.is_canonical());
        admitted?;

        Ok(self.position_table())
    }

    fn evict(&mut self, references: &[K]) {
        for slot in self.slots.iter_mut() {
            let evicted = matches!(slot, Some(s) if !references.contains(&s.identity));
            if evicted {
                if let Some(s) = slot.take() {
                    log::debug!(
                        "evicting {:?} from frame store {}",
                        s.identity,
                        s.frame_store_id
                    );
                }
            }
        }
    }

    fn lowest_free_frame_store_id(&self) -> Option<usize> {
        (0..self.num_slots()).find(|id| {
            !self
                .slots
                .iter()
                .flatten()
                .any(|s| s.frame_store_id == *id)
        })
    }

    fn admit<F>(&mut self, references: &[K], resolve: &mut F) -> Result<(), SlotError>
    where
        F: FnMut(K) -> anyhow::Result<R>,
    {
        for &identity in references {
            if self.find(identity).is_some() {
                continue;
            }

            // Both exist: the reference count was checked against the number of slots.
            let (Some(frame_store_id), Some(position)) = (
                self.lowest_free_frame_store_id(),
                self.slots.iter().position(Option::is_none),
            ) else {
                return Err(SlotError::TooManyReferences {
                    requested: references.len(),
                    capacity: self.num_slots(),
                });
            };

            let resource = resolve(identity).map_err(|source| SlotError::Resolve {
                identity: format!("{:?}", identity),
                source,
            })?;

            log::debug!(
                "admitting {:?} into frame store {}",
                identity,
                frame_store_id
            );
            self.slots[position] = Some(ReferenceSlot {
                identity,
                frame_store_id,
                resource,
            });
        }

        Ok(())
    }

    /// Swaps slots until every occupied slot sits at the index of its frame store id.
    fn canonicalize(&mut self) {
        for position in 0..self.slots.len() {
            while let Some(target) = self.slots[position]
                .as_ref()
                .map(|s| s.frame_store_id)
                .filter(|id| *id != position)
            {
                self.slots.swap(position, target);
            }
        }
    }

    fn is_canonical(&self) -> bool {
        self.slots
            .iter()
            .enumerate()
            .all(|(i, s)| s.as_ref().map_or(true, |s| s.frame_store_id == i))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use anyhow::anyhow;

    use super::*;

    type Allocator = ReferenceSlotAllocator<char, ()>;

    fn run(alloc: &mut Allocator, refs: &[char]) -> PositionTable<char> {
        alloc.run_once_per_frame(refs, |_| Ok(())).unwrap()
    }

    fn ids(alloc: &Allocator, refs: &[char]) -> Vec<Option<usize>> {
        refs.iter().map(|r| alloc.frame_store_id(*r)).collect()
    }

    fn check_invariants(alloc: &Allocator) {
        let mut seen = vec![false; alloc.num_slots()];
        for (position, slot) in alloc.slots().enumerate() {
            if let Some(slot) = slot {
                assert_eq!(slot.frame_store_id(), position);
                assert!(!seen[slot.frame_store_id()]);
                seen[slot.frame_store_id()] = true;
            }
        }
    }

    #[test]
    fn evicts_and_admits_lowest_free_id() {
        let mut alloc = Allocator::new(16);

        let table = run(&mut alloc, &['A', 'B', 'C']);
        assert_eq!(table.iter().take(4).collect::<Vec<_>>(), [Some('A'), Some('B'), Some('C'), None]);

        let table = run(&mut alloc, &['B', 'C', 'D']);
        assert_eq!(table.get(0), Some('D'));
        assert_eq!(table.get(1), Some('B'));
        assert_eq!(table.get(2), Some('C'));
        assert_eq!(table.occupied(), 3);
        assert_eq!(alloc.frame_store_id('A'), None);
        check_invariants(&alloc);
    }

    #[test]
    fn unchanged_reference_set_is_idempotent() {
        let mut alloc = Allocator::new(4);

        run(&mut alloc, &['A', 'B', 'C']);
        let first = run(&mut alloc, &['C', 'A', 'E']);
        let second = run(&mut alloc, &['C', 'A', 'E']);

        assert_eq!(first, second);
        check_invariants(&alloc);
    }

    #[test]
    fn retained_pictures_keep_their_id() {
        let mut alloc = Allocator::new(16);
        let frames: [&[char]; 6] = [
            &['A'],
            &['A', 'B'],
            &['B', 'C', 'A'],
            &['C', 'D'],
            &['E', 'D', 'C', 'F', 'G'],
            &['G', 'A', 'C'],
        ];

        let mut previous: Vec<(char, usize)> = vec![];
        for refs in frames {
            run(&mut alloc, refs);
            check_invariants(&alloc);

            for (identity, id) in &previous {
                if refs.contains(identity) {
                    assert_eq!(alloc.frame_store_id(*identity), Some(*id));
                }
            }

            previous = refs
                .iter()
                .map(|r| (*r, alloc.frame_store_id(*r).unwrap()))
                .collect();
        }
    }

    #[test]
    fn duplicates_in_reference_set() {
        let mut alloc = Allocator::new(2);

        run(&mut alloc, &['A', 'A', 'B', 'A']);
        assert_eq!(ids(&alloc, &['A', 'B']), [Some(0), Some(1)]);
    }

    #[test]
    fn too_many_references() {
        let mut alloc = Allocator::new(2);
        run(&mut alloc, &['A', 'B']);

        assert!(matches!(
            alloc.run_once_per_frame(&['C', 'D', 'E'], |_| Ok(())),
            Err(SlotError::TooManyReferences {
                requested: 3,
                capacity: 2
            })
        ));
        // The table is left untouched.
        assert_eq!(ids(&alloc, &['A', 'B']), [Some(0), Some(1)]);
    }

    #[test]
    fn empty_reference_set_releases_everything() {
        let released = Rc::new(Cell::new(0));

        struct Resource(Rc<Cell<usize>>);
        impl Drop for Resource {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let mut alloc = ReferenceSlotAllocator::<u32, Resource>::new(16);
        alloc
            .run_once_per_frame(&[1, 2, 3], |_| Ok(Resource(released.clone())))
            .unwrap();
        assert_eq!(released.get(), 0);

        let table = alloc.run_once_per_frame(&[2], |_| Ok(Resource(released.clone()))).unwrap();
        assert_eq!(released.get(), 2);
        assert_eq!(table.position(2), Some(1));

        alloc.run_once_per_frame(&[], |_| Ok(Resource(released.clone()))).unwrap();
        assert_eq!(released.get(), 3);
        assert_eq!(alloc.occupied(), 0);
    }

    #[test]
    fn resolve_only_called_for_admissions() {
        let mut alloc = ReferenceSlotAllocator::<u32, u32>::new(16);
        let mut calls = vec![];

        alloc
            .run_once_per_frame(&[7, 8], |id| {
                calls.push(id);
                Ok(id * 10)
            })
            .unwrap();
        alloc
            .run_once_per_frame(&[8, 9], |id| {
                calls.push(id);
                Ok(id * 10)
            })
            .unwrap();

        assert_eq!(calls, [7, 8, 9]);
        assert_eq!(alloc.get(0).map(|s| *s.resource()), Some(90));
        assert_eq!(alloc.get(1).map(|s| *s.resource()), Some(80));
    }

    #[test]
    fn resolve_failure_keeps_table_consistent() {
        let mut alloc = Allocator::new(4);
        run(&mut alloc, &['A', 'B', 'C']);

        let err = alloc
            .run_once_per_frame(&['C', 'D', 'E'], |identity| {
                if identity == 'E' {
                    Err(anyhow!("no memory"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, SlotError::Resolve { ref identity, .. } if identity == "'E'"));

        check_invariants(&alloc);
        assert_eq!(ids(&alloc, &['A', 'B', 'C', 'D', 'E']), [None, None, Some(2), Some(0), None]);

        // The next frame starts from a coherent table.
        run(&mut alloc, &['C', 'D', 'E']);
        check_invariants(&alloc);
        assert_eq!(ids(&alloc, &['C', 'D', 'E']), [Some(2), Some(0), Some(1)]);
    }

    #[test]
    fn canonicalization_restores_positions() {
        let mut alloc = Allocator::new(4);
        // Out of order slots, as left by an admission into a non-canonical table.
        alloc.slots[0] = Some(ReferenceSlot {
            identity: 'X',
            frame_store_id: 2,
            resource: (),
        });
        alloc.slots[1] = Some(ReferenceSlot {
            identity: 'Y',
            frame_store_id: 3,
            resource: (),
        });
        alloc.slots[3] = Some(ReferenceSlot {
            identity: 'Z',
            frame_store_id: 0,
            resource: (),
        });

        alloc.canonicalize();
        check_invariants(&alloc);
        assert_eq!(
            alloc.position_table().iter().collect::<Vec<_>>(),
            [Some('Z'), None, Some('X'), Some('Y')]
        );
    }
}

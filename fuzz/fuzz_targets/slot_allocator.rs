#![no_main]

use i965_pipeline::reference::ReferenceSlotAllocator;
use libfuzzer_sys::fuzz_target;

const NUM_SLOTS: usize = 16;

fuzz_target!(|data: &[u8]| {
    let mut alloc = ReferenceSlotAllocator::<u8, ()>::new(NUM_SLOTS);
    let mut previous: Vec<(u8, usize)> = Vec::new();

    // Each frame is a length byte followed by that many picture identities.
    let mut data = data;
    while let Some((&len, rest)) = data.split_first() {
        let len = (len as usize).min(rest.len());
        let (refs, rest) = rest.split_at(len);
        data = rest;

        let Ok(table) = alloc.run_once_per_frame(refs, |_| Ok(())) else {
            continue;
        };

        let mut seen = [false; NUM_SLOTS];
        for (position, slot) in alloc.slots().enumerate() {
            if let Some(slot) = slot {
                assert_eq!(slot.frame_store_id(), position);
                assert!(!std::mem::replace(&mut seen[position], true));
                assert!(refs.contains(&slot.identity()));
                assert_eq!(table.get(position), Some(slot.identity()));
            }
        }

        for (identity, id) in &previous {
            if refs.contains(identity) {
                assert_eq!(alloc.frame_store_id(*identity), Some(*id));
            }
        }

        previous = refs
            .iter()
            .filter_map(|r| alloc.frame_store_id(*r).map(|id| (*r, id)))
            .collect();

        // Running again with the same set changes nothing.
        let again = alloc.run_once_per_frame(refs, |_| Ok(())).unwrap();
        assert_eq!(table, again);
    }
});

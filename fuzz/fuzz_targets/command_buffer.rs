#![no_main]

use std::rc::Rc;

use i965_pipeline::backend::memory::MemoryKernel;
use i965_pipeline::backend::Ring;
use i965_pipeline::batch::CommandBuffer;
use i965_pipeline::config::Config;
use i965_pipeline::hw::Generation;
use i965_pipeline::hw::MI_BATCH_BUFFER_END;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let kernel = Rc::new(MemoryKernel::new());
    let config = Config::new(Generation::Gen6).with_batch_words(64);
    let mut batch = CommandBuffer::new(kernel.clone(), &config).unwrap();

    for op in data.chunks(2) {
        let arg = op.get(1).copied().unwrap_or(0) as usize;

        let result = match op[0] % 8 {
            0 => batch.reserve(arg),
            1 => batch.write(arg as u32),
            2 => batch.write_data(&vec![arg as u32; arg % 16]),
            3 => batch.begin_atomic(arg),
            4 => batch.end_atomic(),
            5 => batch.emit_mi_flush(),
            6 => batch.select_ring([Ring::Render, Ring::Bsd, Ring::Blt][arg % 3]),
            _ => batch.flush().map(|()| assert!(batch.is_empty() && !batch.is_atomic())),
        };

        assert!(batch.used() <= batch.capacity());
        if op[0] % 8 == 3 && result.is_ok() {
            assert!(batch.free_space() >= arg);
        }

        if result.is_err() {
            batch.reset().unwrap();
        }
    }

    for submission in kernel.submissions().iter() {
        assert_eq!(submission.words.last(), Some(&MI_BATCH_BUFFER_END));
        assert_eq!(submission.words.len() % 2, 0);
    }
});

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command submission engine for Intel GEN4-GEN7 video pipelines.
//!
//! Codec pipelines build GPU command streams through a [`batch::CommandBuffer`], keep their
//! reference pictures in hardware frame stores through a [`reference::ReferenceSlotAllocator`],
//! and let a [`pipeline::PipelineProgrammer`] split a frame's work across as many batches as
//! needed. A [`context::DecodeContext`] ties these together for one stream.

pub mod backend;
pub mod batch;
pub mod bo;
pub mod config;
pub mod context;
pub mod hw;
pub mod pipeline;
pub mod reference;
pub mod surface;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

// Copyright 2025 salon Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Monotonic counters for internal components and tests to sense the system
//! status, updated per event without batching.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters of the cache engine.
#[derive(Debug, Default)]
pub struct Statistics {
    loaders_dispatched: AtomicU64,
    loads_completed: AtomicU64,
    loads_errored: AtomicU64,
    images_added: AtomicU64,
    images_evicted: AtomicU64,
    requests_evicted: AtomicU64,
    ram_overflows: AtomicU64,
    video_overflows: AtomicU64,
}

macro_rules! counter {
    ($field:ident, $inc:ident) => {
        /// Current counter value.
        pub fn $field(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }

        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Statistics {
    counter! { loaders_dispatched, inc_loaders_dispatched }
    counter! { loads_completed, inc_loads_completed }
    counter! { loads_errored, inc_loads_errored }
    counter! { images_added, inc_images_added }
    counter! { images_evicted, inc_images_evicted }
    counter! { requests_evicted, inc_requests_evicted }
    counter! { ram_overflows, inc_ram_overflows }
    counter! { video_overflows, inc_video_overflows }
}

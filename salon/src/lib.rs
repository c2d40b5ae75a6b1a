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

#![warn(missing_docs)]

//! A client-side image cache that coordinates the loading, decoding, and
//! on-screen rendering of many images under strict memory budgets.
//!
//! Consumers declare render requests, the desire to display a URL at a pixel
//! extent within a named bucket, and the [`Controller`] fetches each URL at most
//! once, tracks compressed (RAM) and decoded (video) memory, evicts unlocked
//! content when budgets are exceeded, and publishes every lifecycle transition as
//! an event so a view layer can drive fade-in, progress bars, and status badges.
//!
//! ```rust,ignore
//! use salon::{Controller, Extent, RequestEvent};
//!
//! let controller = Controller::builder()
//!     .with_ram_bytes_budget(128 << 20)
//!     .with_video_bytes_budget(256 << 20)
//!     .build()?;
//!
//! let bucket = controller.add_bucket("page-1", false);
//! let request = bucket.request("https://example.com/hero.jpg", Extent::new(800, 600));
//! request.on(|event| {
//!     if let RequestEvent::ImageLoaded { .. } = event {
//!         // paint, then:
//!         // request.mark_rendered();
//!     }
//! });
//! ```

use salon_cache as cache;
use salon_common as common;

mod prelude;
pub use prelude::*;

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

use std::{collections::BTreeSet, sync::Arc};

use bitflags::bitflags;
use bytes::Bytes;
use salon_common::event::{Emitter, HandlerId};

use crate::{
    controller::ControllerShared,
    loader::{LoadError, Loader},
    request::RequestId,
};

/// Stable identifier of an image within its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub(crate) u64);

/// Events of one cached image.
#[derive(Debug, Clone)]
pub enum ImageEvent {
    /// The byte fetch began.
    LoadStart,
    /// Bytes arrived.
    Progress {
        /// Bytes received so far.
        loaded: u64,
        /// Expected total byte count, if known.
        total: Option<u64>,
    },
    /// The byte fetch completed; the blob is materialised.
    LoadEnd,
    /// The natural pixel dimensions are known.
    Size {
        /// Natural width.
        width: u32,
        /// Natural height.
        height: u32,
    },
    /// The blob could not be decoded as an image.
    BlobError {
        /// Human-readable failure reason.
        reason: String,
    },
    /// The byte fetch failed.
    Error {
        /// The failure.
        error: LoadError,
    },
    /// A render request was attached.
    RenderRequestAdded,
    /// A render request was detached.
    RenderRequestRemoved,
    /// An attached render request reported it painted.
    RenderRequestRendered,
    /// Terminal: the image was cleared and must not be resurrected.
    Clear,
}

bitflags! {
    /// Lifecycle flags of an image entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageFlags: u8 {
        /// The compressed payload is materialised.
        const LOADED = 0b001;
        /// The natural pixel dimensions are known.
        const GOT_SIZE = 0b010;
        /// At least one attached request has painted the image.
        const DECODED = 0b100;
    }
}

/// The cache entry for one source URL, owned by the controller registry.
pub(crate) struct ImageEntry {
    pub(crate) url: Arc<str>,
    pub(crate) headers: Vec<(String, String)>,

    pub(crate) blob: Option<Bytes>,
    /// Compressed payload size, once known.
    pub(crate) bytes: u64,
    /// Decoded estimate (`width · height · 4`), non-zero iff decoded.
    pub(crate) bytes_uncompressed: u64,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) flags: ImageFlags,

    pub(crate) requests: BTreeSet<RequestId>,
    pub(crate) loader: Option<Loader>,

    /// Progress numerator reported by the loader.
    pub(crate) loaded_bytes: u64,
    /// Progress denominator, if the transport knows it.
    pub(crate) total_bytes: Option<u64>,

    /// Recency tick: bumped on creation, request attach, and render.
    pub(crate) last_used: u64,

    pub(crate) emitter: Emitter<ImageEvent>,
}

impl ImageEntry {
    pub(crate) fn new(url: Arc<str>, headers: Vec<(String, String)>, tick: u64) -> Self {
        Self {
            url,
            headers,
            blob: None,
            bytes: 0,
            bytes_uncompressed: 0,
            width: 0,
            height: 0,
            flags: ImageFlags::empty(),
            requests: BTreeSet::new(),
            loader: None,
            loaded_bytes: 0,
            total_bytes: None,
            last_used: tick,
            emitter: Emitter::new(),
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.flags.contains(ImageFlags::LOADED)
    }

    pub(crate) fn got_size(&self) -> bool {
        self.flags.contains(ImageFlags::GOT_SIZE)
    }

    pub(crate) fn is_decoded(&self) -> bool {
        self.flags.contains(ImageFlags::DECODED)
    }

    /// Record the natural dimensions reported by the decoder.
    pub(crate) fn on_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.flags.insert(ImageFlags::GOT_SIZE);
    }

    /// Flip the decoded state, keeping the decoded-byte estimate in sync with it.
    pub(crate) fn set_decoded(&mut self, decoded: bool) {
        debug_assert!(!decoded || self.got_size());
        self.flags.set(ImageFlags::DECODED, decoded);
        self.bytes_uncompressed = if decoded {
            self.width as u64 * self.height as u64 * 4
        } else {
            0
        };
    }

    /// Compressed plus (when decoded) estimated decoded bytes.
    pub(crate) fn bytes_ram(&self) -> u64 {
        self.bytes + if self.is_decoded() { self.bytes_uncompressed } else { 0 }
    }
}

/// A handle to one cached image.
///
/// Handles are cheap to clone and stay valid after the image is evicted; queries on
/// a dead image report the cleared state.
pub struct Image {
    pub(crate) shared: Arc<ControllerShared>,
    pub(crate) id: ImageId,
    pub(crate) url: Arc<str>,
    pub(crate) emitter: Emitter<ImageEvent>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image").field("url", &self.url).finish()
    }
}

impl Clone for Image {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            id: self.id,
            url: self.url.clone(),
            emitter: self.emitter.clone(),
        }
    }
}

impl Image {
    /// The source URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Subscribe to this image's events.
    pub fn on<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ImageEvent) + Send + Sync + 'static,
    {
        self.emitter.on(handler)
    }

    /// Unsubscribe a handler.
    pub fn off(&self, id: HandlerId) -> bool {
        self.emitter.off(id)
    }

    /// Returns `true` while the image is present in the controller registry.
    pub fn is_live(&self) -> bool {
        self.shared.inner.lock().images.contains_key(&self.id)
    }

    /// Returns `true` once the compressed payload is materialised.
    pub fn is_loaded(&self) -> bool {
        self.shared
            .inner
            .lock()
            .images
            .get(&self.id)
            .map(|image| image.is_loaded())
            .unwrap_or(false)
    }

    /// Returns `true` once any attached request painted the image.
    pub fn is_decoded(&self) -> bool {
        self.shared
            .inner
            .lock()
            .images
            .get(&self.id)
            .map(|image| image.is_decoded())
            .unwrap_or(false)
    }

    /// Natural dimensions, once known.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.shared
            .inner
            .lock()
            .images
            .get(&self.id)
            .filter(|image| image.got_size())
            .map(|image| (image.width, image.height))
    }

    /// Compressed plus (when decoded) estimated decoded bytes.
    pub fn bytes_ram(&self) -> u64 {
        self.shared
            .inner
            .lock()
            .images
            .get(&self.id)
            .map(|image| image.bytes_ram())
            .unwrap_or(0)
    }

    /// Returns `true` if any attached render request is locked.
    pub fn is_locked(&self) -> bool {
        self.shared.inner.lock().image_is_locked(self.id)
    }

    /// Number of attached render requests.
    pub fn request_count(&self) -> usize {
        self.shared
            .inner
            .lock()
            .images
            .get(&self.id)
            .map(|image| image.requests.len())
            .unwrap_or(0)
    }
}

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

use std::sync::Arc;

use bitflags::bitflags;
use salon_common::event::{Emitter, HandlerId};
use serde::{Deserialize, Serialize};

use crate::{bucket::BucketId, controller::ControllerShared, image::ImageId, loader::LoadError};

/// Stable identifier of a render request within its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

/// A pixel extent (width × height).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Extent {
    /// Create an extent.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Estimated video memory of an RGBA bitmap at this extent.
    pub fn bytes_video(&self) -> u64 {
        self.width as u64 * self.height as u64 * 4
    }
}

impl std::fmt::Display for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Lifecycle of a render request.
///
/// `ImagePending → ImageLoaded` when the owning image reports its natural size;
/// `ImageLoaded → Rendered` when the view layer calls
/// [`RenderRequest::mark_rendered`]; `Cleared` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for the owning image's natural size.
    ImagePending,
    /// The owning image knows its natural size; the view may paint.
    ImageLoaded,
    /// The view painted the bitmap.
    Rendered,
    /// Terminal: detached from image and bucket.
    Cleared,
}

/// Events of one render request.
#[derive(Debug, Clone)]
pub enum RequestEvent {
    /// The owning image reported its natural size; the view may paint.
    ImageLoaded {
        /// Natural width of the owning image.
        width: u32,
        /// Natural height of the owning image.
        height: u32,
    },
    /// The request transitioned to rendered.
    Rendered,
    /// The owning image failed to load or decode.
    Error {
        /// The failure.
        error: LoadError,
    },
    /// Terminal: the request was detached.
    Cleared,
}

bitflags! {
    /// State flags of a request entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u8 {
        /// The view painted the bitmap.
        const RENDERED = 0b001;
        /// The bitmap is currently visible on screen.
        const VISIBLE = 0b010;
        /// Explicitly pinned against eviction.
        const PINNED = 0b100;
    }
}

/// One (image, extent, bucket) binding, owned by the controller registry.
pub(crate) struct RequestEntry {
    pub(crate) image: ImageId,
    pub(crate) bucket: BucketId,
    pub(crate) size: Extent,
    pub(crate) state: RequestState,
    pub(crate) flags: RequestFlags,
    pub(crate) emitter: Emitter<RequestEvent>,
}

impl RequestEntry {
    pub(crate) fn new(image: ImageId, bucket: BucketId, size: Extent, visible: bool, pinned: bool) -> Self {
        let mut flags = RequestFlags::empty();
        flags.set(RequestFlags::VISIBLE, visible);
        flags.set(RequestFlags::PINNED, pinned);
        Self {
            image,
            bucket,
            size,
            state: RequestState::ImagePending,
            flags,
            emitter: Emitter::new(),
        }
    }

    pub(crate) fn is_rendered(&self) -> bool {
        self.flags.contains(RequestFlags::RENDERED)
    }

    pub(crate) fn is_visible(&self) -> bool {
        self.flags.contains(RequestFlags::VISIBLE)
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.flags.contains(RequestFlags::PINNED)
    }

    pub(crate) fn bytes_video(&self) -> u64 {
        self.size.bytes_video()
    }
}

/// A handle to one render request.
///
/// Returned by `Controller::request`; the view layer drives it (`mark_rendered`,
/// `set_visible`) and tears it down with `clear` on unmount. Handles are cheap to
/// clone and stay valid after the request is cleared.
pub struct RenderRequest {
    pub(crate) shared: Arc<ControllerShared>,
    pub(crate) id: RequestId,
    pub(crate) url: Arc<str>,
    pub(crate) size: Extent,
    pub(crate) emitter: Emitter<RequestEvent>,
}

impl std::fmt::Debug for RenderRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderRequest")
            .field("url", &self.url)
            .field("size", &self.size)
            .finish()
    }
}

impl Clone for RenderRequest {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            id: self.id,
            url: self.url.clone(),
            size: self.size,
            emitter: self.emitter.clone(),
        }
    }
}

impl RenderRequest {
    /// The source URL of the owning image.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The requested pixel extent.
    pub fn size(&self) -> Extent {
        self.size
    }

    /// Estimated video memory of the bitmap at the requested extent.
    pub fn bytes_video(&self) -> u64 {
        self.size.bytes_video()
    }

    /// Subscribe to this request's events.
    pub fn on<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&RequestEvent) + Send + Sync + 'static,
    {
        self.emitter.on(handler)
    }

    /// Unsubscribe a handler.
    pub fn off(&self, id: HandlerId) -> bool {
        self.emitter.off(id)
    }

    /// Current lifecycle state; `Cleared` once detached.
    pub fn state(&self) -> RequestState {
        self.shared
            .inner
            .lock()
            .requests
            .get(&self.id)
            .map(|request| request.state)
            .unwrap_or(RequestState::Cleared)
    }

    /// Invoked by the view layer after the bitmap is painted.
    pub fn mark_rendered(&self) {
        ControllerShared::mark_rendered(&self.shared, self.id);
    }

    /// Report whether the bitmap is currently visible on screen.
    ///
    /// Invisible requests are preferred by video memory eviction.
    pub fn set_visible(&self, visible: bool) {
        ControllerShared::set_visible(&self.shared, self.id, visible);
    }

    /// Pin this request against eviction.
    pub fn pin(&self) {
        ControllerShared::set_pinned(&self.shared, self.id, true);
    }

    /// Remove the per-request pin. The bucket lock, if any, still applies.
    pub fn unpin(&self) {
        ControllerShared::set_pinned(&self.shared, self.id, false);
    }

    /// Returns `true` when the bucket is locked or the request is pinned.
    pub fn is_locked(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner
            .requests
            .get(&self.id)
            .map(|request| inner.request_is_locked(request))
            .unwrap_or(false)
    }

    /// Detach this request from its image and bucket.
    ///
    /// If the owning image is left without requests it is evicted. Idempotent.
    pub fn clear(&self) {
        ControllerShared::clear_request(&self.shared, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_video_bytes() {
        assert_eq!(Extent::new(100, 100).bytes_video(), 40_000);
        assert_eq!(Extent::new(200, 200).bytes_video(), 160_000);
        assert_eq!(Extent::new(0, 100).bytes_video(), 0);
    }

    #[test]
    fn test_entry_flags() {
        let entry = RequestEntry::new(ImageId(1), BucketId(1), Extent::new(8, 8), true, false);
        assert!(entry.is_visible());
        assert!(!entry.is_pinned());
        assert!(!entry.is_rendered());
        assert_eq!(entry.state, RequestState::ImagePending);
        assert_eq!(entry.bytes_video(), 256);
    }
}

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

use std::{
    cmp::Reverse,
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use ahash::RandomState;
use itertools::Itertools;
use parking_lot::Mutex;
use salon_common::event::{Emitter, HandlerId};

use crate::{
    bucket::{Bucket, BucketEntry, BucketEvent, BucketId},
    config::{ControllerBuilder, ControllerConfig},
    decode::Decoder,
    fetch::{FetchJob, Fetcher},
    image::{Image, ImageEntry, ImageEvent, ImageFlags, ImageId},
    loader::{LoadError, Loader, LoaderEvent},
    network::Network,
    request::{Extent, RenderRequest, RequestEntry, RequestEvent, RequestFlags, RequestId, RequestState},
    statistics::Statistics,
};

/// Controller-level events.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// An image entered the registry.
    ImageAdded {
        /// The source URL.
        url: Arc<str>,
    },
    /// An image left the registry.
    ImageRemoved {
        /// The source URL.
        url: Arc<str>,
    },
    /// RAM usage still exceeds the budget after eviction ran to completion.
    RamOverflow {
        /// Current compressed plus decoded bytes.
        used: u64,
        /// The configured ceiling.
        budget: u64,
    },
    /// Video usage still exceeds the budget after eviction ran to completion.
    VideoOverflow {
        /// Current decoded bytes across all extents.
        used: u64,
        /// The configured ceiling.
        budget: u64,
    },
    /// Controller state changed; counters and usage totals are settled.
    Update,
}

/// Parameters of one render request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// The source URL.
    pub url: String,
    /// The pixel extent to display at.
    pub size: Extent,
    /// The bucket the request belongs to. Created unlocked if unknown.
    pub bucket: String,
    /// Extra HTTP headers for this image's fetch.
    pub headers: Vec<(String, String)>,
    /// Whether the bitmap is initially visible on screen.
    pub visible: bool,
    /// Whether the request is pinned against eviction from the start.
    pub pinned: bool,
}

impl RequestOptions {
    /// Options for displaying `url` at `size` within `bucket`.
    pub fn new(url: impl Into<String>, size: Extent, bucket: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            size,
            bucket: bucket.into(),
            headers: Vec::new(),
            visible: true,
            pinned: false,
        }
    }

    /// Attach an HTTP header to this image's fetch.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the initial visibility.
    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Set the initial pin.
    pub fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }
}

/// Outbound work collected under the registry lock and performed after it is
/// released: consumer events, fetch spawns, loader aborts.
///
/// Handlers therefore observe settled state and may re-enter the controller.
#[derive(Default)]
struct Outbox {
    items: Vec<Outbound>,
}

enum Outbound {
    Controller(ControllerEvent),
    Image(Emitter<ImageEvent>, ImageEvent),
    Request(Emitter<RequestEvent>, RequestEvent),
    Bucket(Emitter<BucketEvent>, BucketEvent),
    /// Drop an image emitter's handlers after its terminal `Clear`.
    Unlisten(Emitter<ImageEvent>),
    Spawn(Loader),
    Abort(Loader),
}

impl Outbox {
    fn controller(&mut self, event: ControllerEvent) {
        self.items.push(Outbound::Controller(event));
    }

    fn image(&mut self, emitter: &Emitter<ImageEvent>, event: ImageEvent) {
        self.items.push(Outbound::Image(emitter.clone(), event));
    }

    fn request(&mut self, emitter: &Emitter<RequestEvent>, event: RequestEvent) {
        self.items.push(Outbound::Request(emitter.clone(), event));
    }

    fn bucket(&mut self, emitter: &Emitter<BucketEvent>, event: BucketEvent) {
        self.items.push(Outbound::Bucket(emitter.clone(), event));
    }

    fn unlisten(&mut self, emitter: &Emitter<ImageEvent>) {
        self.items.push(Outbound::Unlisten(emitter.clone()));
    }

    fn spawn(&mut self, loader: Loader) {
        self.items.push(Outbound::Spawn(loader));
    }

    fn abort(&mut self, loader: Loader) {
        self.items.push(Outbound::Abort(loader));
    }
}

pub(crate) struct ControllerInner {
    pub(crate) images: HashMap<ImageId, ImageEntry>,
    pub(crate) by_url: HashMap<Arc<str>, ImageId, RandomState>,
    pub(crate) requests: HashMap<RequestId, RequestEntry>,
    pub(crate) buckets: HashMap<BucketId, BucketEntry>,
    pub(crate) by_name: HashMap<Arc<str>, BucketId, RandomState>,
    pub(crate) network: Network,

    pub(crate) ram_used: u64,
    pub(crate) video_used: u64,

    /// Source of entity ids and recency ticks.
    seq: u64,
    closed: bool,
}

impl ControllerInner {
    fn tick(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub(crate) fn request_is_locked(&self, request: &RequestEntry) -> bool {
        request.is_pinned()
            || self
                .buckets
                .get(&request.bucket)
                .map(|bucket| bucket.locked)
                .unwrap_or(false)
    }

    pub(crate) fn image_is_locked(&self, id: ImageId) -> bool {
        self.images
            .get(&id)
            .map(|image| {
                image
                    .requests
                    .iter()
                    .any(|rid| self.requests.get(rid).map(|r| self.request_is_locked(r)).unwrap_or(false))
            })
            .unwrap_or(false)
    }

    /// Keep an image's decoded state equal to the OR of its requests' rendered flags.
    fn refresh_decoded(&mut self, id: ImageId) {
        let Some(image) = self.images.get(&id) else { return };
        let any_rendered = image
            .requests
            .iter()
            .any(|rid| self.requests.get(rid).map(|r| r.is_rendered()).unwrap_or(false));
        if image.is_decoded() != any_rendered {
            self.images
                .get_mut(&id)
                .expect("image row just observed")
                .set_decoded(any_rendered);
        }
    }

    pub(crate) fn recompute_usage(&mut self) {
        let ram = self.images.values().map(|image| image.bytes_ram()).sum();
        let video = self
            .requests
            .values()
            .filter(|r| self.images.get(&r.image).map(|i| i.is_decoded()).unwrap_or(false))
            .map(|r| r.bytes_video())
            .sum();
        self.ram_used = ram;
        self.video_used = video;
    }

    fn bucket_images(&self, id: BucketId) -> BTreeSet<ImageId> {
        self.buckets
            .get(&id)
            .map(|bucket| {
                bucket
                    .requests
                    .iter()
                    .filter_map(|rid| self.requests.get(rid))
                    .map(|r| r.image)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Aggregate load progress over the bucket's distinct images.
    pub(crate) fn bucket_progress(&self, id: BucketId) -> f64 {
        let mut loaded = 0u64;
        let mut total = 0u64;
        for iid in self.bucket_images(id) {
            let Some(image) = self.images.get(&iid) else { continue };
            loaded += image.loaded_bytes;
            total += image
                .total_bytes
                .unwrap_or(if image.is_loaded() { image.bytes } else { image.loaded_bytes });
        }
        if total == 0 {
            0.0
        } else {
            loaded as f64 / total as f64
        }
    }

    pub(crate) fn bucket_rendered_fraction(&self, id: BucketId) -> f64 {
        let Some(bucket) = self.buckets.get(&id) else { return 0.0 };
        if bucket.requests.is_empty() {
            return 0.0;
        }
        let rendered = bucket
            .requests
            .iter()
            .filter(|rid| self.requests.get(rid).map(|r| r.is_rendered()).unwrap_or(false))
            .count();
        rendered as f64 / bucket.requests.len() as f64
    }

    fn bucket_all_loaded(&self, id: BucketId) -> bool {
        let images = self.bucket_images(id);
        !images.is_empty()
            && images
                .iter()
                .all(|iid| self.images.get(iid).map(|i| i.is_loaded()).unwrap_or(false))
    }

    fn bucket_all_rendered(&self, id: BucketId) -> bool {
        self.buckets
            .get(&id)
            .map(|bucket| {
                !bucket.requests.is_empty()
                    && bucket
                        .requests
                        .iter()
                        .all(|rid| self.requests.get(rid).map(|r| r.is_rendered()).unwrap_or(false))
            })
            .unwrap_or(false)
    }

    /// Number of distinct extents attached to an image.
    fn image_distinct_sizes(&self, id: ImageId) -> usize {
        self.images
            .get(&id)
            .map(|image| {
                image
                    .requests
                    .iter()
                    .filter_map(|rid| self.requests.get(rid))
                    .map(|r| r.size)
                    .unique()
                    .count()
            })
            .unwrap_or(0)
    }
}

pub(crate) struct ControllerShared {
    pub(crate) config: ControllerConfig,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) decoder: Arc<dyn Decoder>,
    pub(crate) statistics: Arc<Statistics>,
    pub(crate) emitter: Emitter<ControllerEvent>,
    pub(crate) inner: Mutex<ControllerInner>,
}

impl ControllerShared {
    /// Run `f` under the registry lock, then perform the collected outbound work
    /// strictly after the lock is released.
    fn with_lock<R>(self: &Arc<Self>, f: impl FnOnce(&mut ControllerInner, &mut Outbox) -> R) -> R {
        let mut outbox = Outbox::default();
        let res = {
            let mut inner = self.inner.lock();
            f(&mut inner, &mut outbox)
        };
        self.flush(outbox);
        res
    }

    fn flush(&self, outbox: Outbox) {
        for item in outbox.items {
            match item {
                Outbound::Controller(event) => self.emitter.emit(&event),
                Outbound::Image(emitter, event) => emitter.emit(&event),
                Outbound::Request(emitter, event) => emitter.emit(&event),
                Outbound::Bucket(emitter, event) => emitter.emit(&event),
                Outbound::Unlisten(emitter) => emitter.clear(),
                Outbound::Spawn(loader) => self.fetcher.fetch(loader.job().clone(), loader.handle()),
                Outbound::Abort(loader) => loader.abort(),
            }
        }
    }

    fn wire_loader(shared: &Arc<Self>, image: ImageId, loader: &Loader) {
        let weak = Arc::downgrade(shared);
        loader.events().on(move |event| {
            if let Some(shared) = weak.upgrade() {
                ControllerShared::on_loader_event(&shared, image, event);
            }
        });
    }

    fn is_overflow(&self, inner: &ControllerInner) -> bool {
        inner.ram_used >= self.config.ram_bytes_budget || inner.video_used >= self.config.video_bytes_budget
    }

    fn ensure_bucket(self: &Arc<Self>, inner: &mut ControllerInner, name: &str, locked: bool) -> BucketId {
        if let Some(&id) = inner.by_name.get(name) {
            return id;
        }
        let tick = inner.tick();
        let id = BucketId(tick);
        let name: Arc<str> = Arc::from(name);
        inner.buckets.insert(id, BucketEntry::new(name.clone(), locked));
        inner.by_name.insert(name, id);
        id
    }

    fn bucket_handle(self: &Arc<Self>, inner: &ControllerInner, id: BucketId) -> Bucket {
        let bucket = inner.buckets.get(&id).expect("bucket row must exist");
        Bucket {
            shared: self.clone(),
            id,
            name: bucket.name.clone(),
            emitter: bucket.emitter.clone(),
        }
    }

    /// The dispatch cycle: spawn loaders while capacity remains, pausing under
    /// memory overflow.
    fn dispatch(shared: &Arc<Self>, inner: &mut ControllerInner, outbox: &mut Outbox) {
        loop {
            if !inner.network.has_capacity() || inner.network.queue_len() == 0 {
                return;
            }
            if shared.is_overflow(inner) {
                tracing::warn!(
                    ram_bytes_used = inner.ram_used,
                    video_bytes_used = inner.video_used,
                    "memory overflow, loader dispatch paused"
                );
                return;
            }
            let Some(id) = inner.network.pop_ready() else { return };
            let Some(image) = inner.images.get_mut(&id) else { continue };

            let job = FetchJob {
                url: image.url.clone(),
                headers: image.headers.clone(),
                timeout: shared.config.loader_timeout,
            };
            let loader = Loader::new(job);
            Self::wire_loader(shared, id, &loader);
            image.loader = Some(loader.clone());
            inner.network.launch(id, loader.clone());
            shared.statistics.inc_loaders_dispatched();
            tracing::trace!(url = %loader.job().url, "loader dispatched");
            outbox.spawn(loader);
        }
    }

    /// Settle step: recompute usage, evict down to the budgets, signal overflow,
    /// publish `Update`, and resume dispatch if eviction freed space.
    fn settle(shared: &Arc<Self>, inner: &mut ControllerInner, outbox: &mut Outbox) {
        inner.recompute_usage();
        if inner.ram_used > shared.config.ram_bytes_budget {
            shared.evict_ram(inner, outbox);
        }
        if inner.video_used > shared.config.video_bytes_budget {
            shared.evict_video(inner, outbox);
        }
        if inner.ram_used > shared.config.ram_bytes_budget {
            shared.statistics.inc_ram_overflows();
            outbox.controller(ControllerEvent::RamOverflow {
                used: inner.ram_used,
                budget: shared.config.ram_bytes_budget,
            });
        }
        if inner.video_used > shared.config.video_bytes_budget {
            shared.statistics.inc_video_overflows();
            outbox.controller(ControllerEvent::VideoOverflow {
                used: inner.video_used,
                budget: shared.config.video_bytes_budget,
            });
        }
        outbox.controller(ControllerEvent::Update);
        Self::dispatch(shared, inner, outbox);
    }

    /// RAM eviction: clear unlocked images, least-recently-used first, ties broken
    /// by fewest attached requests, then largest RAM footprint.
    fn evict_ram(&self, inner: &mut ControllerInner, outbox: &mut Outbox) {
        while inner.ram_used > self.config.ram_bytes_budget {
            let candidate = inner
                .images
                .iter()
                // A pending image holds no bytes yet; clearing it frees nothing.
                .filter(|(_, image)| image.bytes_ram() > 0)
                .filter(|(id, _)| !inner.image_is_locked(**id))
                .min_by_key(|(_, image)| (image.last_used, image.requests.len(), Reverse(image.bytes_ram())))
                .map(|(id, _)| *id);
            let Some(id) = candidate else { break };
            tracing::debug!(image = id.0, ram_bytes_used = inner.ram_used, "evicting image");
            self.clear_image(inner, id, outbox);
            self.statistics.inc_images_evicted();
            inner.recompute_usage();
        }
    }

    /// Video eviction: tear down per-extent requests of images with multiple
    /// extents attached, preferring invisible ones, then clear fully unused images.
    fn evict_video(&self, inner: &mut ControllerInner, outbox: &mut Outbox) {
        while inner.video_used > self.config.video_bytes_budget {
            let candidate = inner
                .requests
                .iter()
                .filter(|(_, r)| r.bytes_video() > 0 && !inner.request_is_locked(r))
                .filter(|(_, r)| inner.images.get(&r.image).map(|i| i.is_decoded()).unwrap_or(false))
                .filter(|(_, r)| inner.image_distinct_sizes(r.image) >= 2)
                .min_by_key(|(_, r)| (r.is_visible(), Reverse(r.bytes_video())))
                .map(|(id, _)| *id);
            let Some(rid) = candidate else { break };
            tracing::debug!(request = rid.0, video_bytes_used = inner.video_used, "evicting render request");
            self.drop_request(inner, rid, outbox);
            self.statistics.inc_requests_evicted();
            inner.recompute_usage();
        }

        let unused = inner
            .images
            .iter()
            .filter(|(_, image)| image.requests.is_empty())
            .map(|(id, _)| *id)
            .collect_vec();
        for id in unused {
            self.clear_image(inner, id, outbox);
            self.statistics.inc_images_evicted();
        }
        inner.recompute_usage();
    }

    /// Detach one request from its image and bucket. Does not cascade to the image.
    fn drop_request(&self, inner: &mut ControllerInner, rid: RequestId, outbox: &mut Outbox) -> bool {
        let Some(mut request) = inner.requests.remove(&rid) else {
            return false;
        };
        request.state = RequestState::Cleared;
        if let Some(bucket) = inner.buckets.get_mut(&request.bucket) {
            bucket.requests.remove(&rid);
        }
        outbox.request(&request.emitter, RequestEvent::Cleared);
        let image_id = request.image;
        if let Some(image) = inner.images.get_mut(&image_id) {
            image.requests.remove(&rid);
            let emitter = image.emitter.clone();
            outbox.image(&emitter, ImageEvent::RenderRequestRemoved);
        }
        inner.refresh_decoded(image_id);
        true
    }

    /// The universal cancellation primitive: abort the in-flight loader, unregister
    /// every request, release the blob, emit `Clear`, drop listeners, and remove the
    /// image from the registry. The image must not be resurrected.
    fn clear_image(&self, inner: &mut ControllerInner, id: ImageId, outbox: &mut Outbox) {
        let Some(mut image) = inner.images.remove(&id) else { return };
        inner.by_url.remove(&image.url);

        let flying = inner.network.remove(id);
        if let Some(loader) = image.loader.take().or(flying) {
            outbox.abort(loader);
        }

        for rid in image.requests.iter().copied().collect_vec() {
            if let Some(request) = inner.requests.remove(&rid) {
                if let Some(bucket) = inner.buckets.get_mut(&request.bucket) {
                    bucket.requests.remove(&rid);
                }
                outbox.request(&request.emitter, RequestEvent::Cleared);
                outbox.image(&image.emitter, ImageEvent::RenderRequestRemoved);
            }
        }

        image.blob = None;
        outbox.image(&image.emitter, ImageEvent::Clear);
        outbox.unlisten(&image.emitter);
        outbox.controller(ControllerEvent::ImageRemoved { url: image.url.clone() });
        tracing::trace!(url = %image.url, "image cleared");
    }

    fn propagate_error(&self, inner: &ControllerInner, image_id: ImageId, error: LoadError, outbox: &mut Outbox) {
        let Some(image) = inner.images.get(&image_id) else { return };
        let mut bucket_ids = BTreeSet::new();
        for rid in image.requests.iter() {
            if let Some(request) = inner.requests.get(rid) {
                outbox.request(&request.emitter, RequestEvent::Error { error: error.clone() });
                bucket_ids.insert(request.bucket);
            }
        }
        for bid in bucket_ids {
            if let Some(bucket) = inner.buckets.get(&bid) {
                outbox.bucket(
                    &bucket.emitter,
                    BucketEvent::Error {
                        url: image.url.clone(),
                        error: error.clone(),
                    },
                );
            }
        }
    }

    fn emit_bucket_progress(&self, inner: &ControllerInner, image_id: ImageId, outbox: &mut Outbox) {
        let Some(image) = inner.images.get(&image_id) else { return };
        let bucket_ids: BTreeSet<BucketId> = image
            .requests
            .iter()
            .filter_map(|rid| inner.requests.get(rid))
            .map(|r| r.bucket)
            .collect();
        for bid in bucket_ids {
            let fraction = inner.bucket_progress(bid);
            if let Some(bucket) = inner.buckets.get(&bid) {
                outbox.bucket(&bucket.emitter, BucketEvent::Progress { fraction });
            }
        }
    }

    fn emit_bucket_loadend(&self, inner: &ControllerInner, image_id: ImageId, outbox: &mut Outbox) {
        let Some(image) = inner.images.get(&image_id) else { return };
        let bucket_ids: BTreeSet<BucketId> = image
            .requests
            .iter()
            .filter_map(|rid| inner.requests.get(rid))
            .map(|r| r.bucket)
            .collect();
        for bid in bucket_ids {
            if inner.bucket_all_loaded(bid) {
                if let Some(bucket) = inner.buckets.get(&bid) {
                    outbox.bucket(&bucket.emitter, BucketEvent::LoadEnd);
                }
            }
        }
    }

    pub(crate) fn request(shared: &Arc<Self>, options: RequestOptions) -> RenderRequest {
        shared.with_lock(|inner, outbox| {
            assert!(!inner.closed, "controller has been shut down");

            let url: Arc<str> = Arc::from(options.url.as_str());
            let bucket_id = shared.ensure_bucket(inner, &options.bucket, false);

            let (image_id, created) = match inner.by_url.get(&url).copied() {
                Some(id) => (id, false),
                None => {
                    let tick = inner.tick();
                    let id = ImageId(tick);
                    let mut headers = shared.config.headers.clone();
                    headers.extend(options.headers.iter().cloned());
                    inner.images.insert(id, ImageEntry::new(url.clone(), headers, tick));
                    inner.by_url.insert(url.clone(), id);
                    shared.statistics.inc_images_added();
                    (id, true)
                }
            };

            let tick = inner.tick();
            let rid = RequestId(tick);
            let mut request = RequestEntry::new(image_id, bucket_id, options.size, options.visible, options.pinned);
            let request_emitter = request.emitter.clone();

            let image = inner.images.get_mut(&image_id).expect("image row just ensured");
            image.last_used = tick;
            if image.got_size() {
                request.state = RequestState::ImageLoaded;
            }
            image.requests.insert(rid);
            let image_emitter = image.emitter.clone();
            let needs_fetch = !image.is_loaded() && image.loader.is_none();

            inner.requests.insert(rid, request);
            inner
                .buckets
                .get_mut(&bucket_id)
                .expect("bucket row just ensured")
                .requests
                .insert(rid);

            outbox.image(&image_emitter, ImageEvent::RenderRequestAdded);
            if created {
                outbox.controller(ControllerEvent::ImageAdded { url: url.clone() });
            }

            if needs_fetch {
                inner.network.add(image_id);
            }
            Self::settle(shared, inner, outbox);

            RenderRequest {
                shared: shared.clone(),
                id: rid,
                url,
                size: options.size,
                emitter: request_emitter,
            }
        })
    }

    pub(crate) fn clear_request(shared: &Arc<Self>, rid: RequestId) {
        shared.with_lock(|inner, outbox| {
            let Some(request) = inner.requests.get(&rid) else { return };
            let image_id = request.image;
            shared.drop_request(inner, rid, outbox);
            if inner
                .images
                .get(&image_id)
                .map(|image| image.requests.is_empty())
                .unwrap_or(false)
            {
                shared.clear_image(inner, image_id, outbox);
                shared.statistics.inc_images_evicted();
            }
            Self::settle(shared, inner, outbox);
        })
    }

    pub(crate) fn mark_rendered(shared: &Arc<Self>, rid: RequestId) {
        shared.with_lock(|inner, outbox| {
            let Some(request) = inner.requests.get_mut(&rid) else { return };
            if request.state != RequestState::ImageLoaded {
                tracing::trace!(request = rid.0, state = ?request.state, "mark_rendered ignored");
                return;
            }
            request.state = RequestState::Rendered;
            request.flags.insert(RequestFlags::RENDERED);
            let request_emitter = request.emitter.clone();
            let image_id = request.image;
            let bucket_id = request.bucket;
            outbox.request(&request_emitter, RequestEvent::Rendered);

            let tick = inner.tick();
            if let Some(image) = inner.images.get_mut(&image_id) {
                image.last_used = tick;
                let emitter = image.emitter.clone();
                outbox.image(&emitter, ImageEvent::RenderRequestRendered);
            }
            inner.refresh_decoded(image_id);

            if inner.bucket_all_rendered(bucket_id) {
                if let Some(bucket) = inner.buckets.get(&bucket_id) {
                    outbox.bucket(&bucket.emitter, BucketEvent::Rendered);
                }
            }
            Self::settle(shared, inner, outbox);
        })
    }

    pub(crate) fn set_visible(shared: &Arc<Self>, rid: RequestId, visible: bool) {
        shared.with_lock(|inner, outbox| {
            let Some(request) = inner.requests.get_mut(&rid) else { return };
            if request.is_visible() == visible {
                return;
            }
            request.flags.set(RequestFlags::VISIBLE, visible);
            Self::settle(shared, inner, outbox);
        })
    }

    pub(crate) fn set_pinned(shared: &Arc<Self>, rid: RequestId, pinned: bool) {
        shared.with_lock(|inner, outbox| {
            let Some(request) = inner.requests.get_mut(&rid) else { return };
            if request.is_pinned() == pinned {
                return;
            }
            request.flags.set(RequestFlags::PINNED, pinned);
            Self::settle(shared, inner, outbox);
        })
    }

    pub(crate) fn set_bucket_locked(shared: &Arc<Self>, id: BucketId, locked: bool) {
        shared.with_lock(|inner, outbox| {
            let Some(bucket) = inner.buckets.get_mut(&id) else { return };
            if bucket.locked == locked {
                return;
            }
            bucket.locked = locked;
            Self::settle(shared, inner, outbox);
        })
    }

    fn clear_bucket_inner(shared: &Arc<Self>, inner: &mut ControllerInner, id: BucketId, outbox: &mut Outbox) {
        let Some(bucket) = inner.buckets.get(&id) else { return };
        let rids = bucket.requests.iter().copied().collect_vec();
        let emitter = bucket.emitter.clone();

        let mut image_ids = BTreeSet::new();
        for rid in rids {
            if let Some(request) = inner.requests.get(&rid) {
                image_ids.insert(request.image);
            }
            shared.drop_request(inner, rid, outbox);
        }
        for iid in image_ids {
            if inner
                .images
                .get(&iid)
                .map(|image| image.requests.is_empty())
                .unwrap_or(false)
            {
                shared.clear_image(inner, iid, outbox);
                shared.statistics.inc_images_evicted();
            }
        }
        outbox.bucket(&emitter, BucketEvent::Clear);
    }

    pub(crate) fn clear_bucket(shared: &Arc<Self>, id: BucketId) {
        shared.with_lock(|inner, outbox| {
            if !inner.buckets.contains_key(&id) {
                return;
            }
            Self::clear_bucket_inner(shared, inner, id, outbox);
            Self::settle(shared, inner, outbox);
        })
    }

    pub(crate) fn on_loader_event(shared: &Arc<Self>, image_id: ImageId, event: &LoaderEvent) {
        shared.with_lock(|inner, outbox| match event {
            LoaderEvent::Start { total } => {
                if let Some(image) = inner.images.get_mut(&image_id) {
                    image.total_bytes = *total;
                    let emitter = image.emitter.clone();
                    outbox.image(&emitter, ImageEvent::LoadStart);
                }
            }
            LoaderEvent::Progress { loaded, total } => {
                let Some(image) = inner.images.get_mut(&image_id) else { return };
                image.loaded_bytes = *loaded;
                if total.is_some() {
                    image.total_bytes = *total;
                }
                let emitter = image.emitter.clone();
                outbox.image(&emitter, ImageEvent::Progress { loaded: *loaded, total: *total });
                shared.emit_bucket_progress(inner, image_id, outbox);
            }
            LoaderEvent::Load { bytes } => {
                if inner.network.on_loaded(image_id).is_some() {
                    shared.statistics.inc_loads_completed();
                }
                let Some(image) = inner.images.get_mut(&image_id) else {
                    Self::dispatch(shared, inner, outbox);
                    return;
                };
                image.loader = None;
                image.blob = Some(bytes.clone());
                image.bytes = bytes.len() as u64;
                image.loaded_bytes = bytes.len() as u64;
                image.total_bytes = Some(bytes.len() as u64);
                image.flags.insert(ImageFlags::LOADED);
                let image_emitter = image.emitter.clone();
                outbox.image(&image_emitter, ImageEvent::LoadEnd);

                match shared.decoder.dimensions(bytes) {
                    Ok((width, height)) => {
                        let image = inner.images.get_mut(&image_id).expect("image row just observed");
                        image.on_size(width, height);
                        outbox.image(&image_emitter, ImageEvent::Size { width, height });
                        for rid in image.requests.iter().copied().collect_vec() {
                            if let Some(request) = inner.requests.get_mut(&rid) {
                                if request.state == RequestState::ImagePending {
                                    request.state = RequestState::ImageLoaded;
                                    let emitter = request.emitter.clone();
                                    outbox.request(&emitter, RequestEvent::ImageLoaded { width, height });
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        outbox.image(&image_emitter, ImageEvent::BlobError { reason: reason.clone() });
                        shared.propagate_error(inner, image_id, LoadError::Decode { reason }, outbox);
                    }
                }

                shared.emit_bucket_progress(inner, image_id, outbox);
                shared.emit_bucket_loadend(inner, image_id, outbox);
                Self::settle(shared, inner, outbox);
            }
            LoaderEvent::Error { error } => {
                Self::on_load_failure(shared, inner, image_id, error.clone(), outbox);
            }
            LoaderEvent::Timeout => {
                Self::on_load_failure(shared, inner, image_id, LoadError::Timeout, outbox);
            }
            LoaderEvent::Abort => {
                inner.network.on_aborted(image_id);
                if let Some(image) = inner.images.get_mut(&image_id) {
                    image.loader = None;
                }
                Self::dispatch(shared, inner, outbox);
            }
        })
    }

    fn on_load_failure(
        shared: &Arc<Self>,
        inner: &mut ControllerInner,
        image_id: ImageId,
        error: LoadError,
        outbox: &mut Outbox,
    ) {
        if inner.network.on_errored(image_id).is_some() {
            shared.statistics.inc_loads_errored();
        }
        let Some(image) = inner.images.get_mut(&image_id) else {
            Self::dispatch(shared, inner, outbox);
            return;
        };
        image.loader = None;
        let emitter = image.emitter.clone();
        tracing::debug!(url = %image.url, %error, "image load failed");
        outbox.image(&emitter, ImageEvent::Error { error: error.clone() });
        shared.propagate_error(inner, image_id, error, outbox);
        Self::settle(shared, inner, outbox);
    }

    pub(crate) fn shutdown(shared: &Arc<Self>) {
        shared.with_lock(|inner, outbox| {
            inner.closed = true;

            for bid in inner.buckets.keys().copied().collect_vec() {
                Self::clear_bucket_inner(shared, inner, bid, outbox);
            }
            inner.buckets.clear();
            inner.by_name.clear();

            for iid in inner.images.keys().copied().collect_vec() {
                shared.clear_image(inner, iid, outbox);
            }

            for loader in inner.network.drain() {
                outbox.abort(loader);
            }

            inner.recompute_usage();
            outbox.controller(ControllerEvent::Update);
        })
    }
}

/// The root of the cache: exclusive owner of every image and bucket.
///
/// Controllers are explicit roots: there is no process-wide instance, and tests
/// spin up as many isolated controllers as they need. Cloning shares the root.
pub struct Controller {
    shared: Arc<ControllerShared>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").field("config", &self.shared.config).finish()
    }
}

impl Clone for Controller {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Controller {
    /// Create a [`ControllerBuilder`].
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    pub(crate) fn new(config: ControllerConfig, fetcher: Arc<dyn Fetcher>, decoder: Arc<dyn Decoder>) -> Self {
        let network = Network::new(config.loaders_max);
        Self {
            shared: Arc::new(ControllerShared {
                config,
                fetcher,
                decoder,
                statistics: Arc::new(Statistics::default()),
                emitter: Emitter::new(),
                inner: Mutex::new(ControllerInner {
                    images: HashMap::new(),
                    by_url: HashMap::default(),
                    requests: HashMap::new(),
                    buckets: HashMap::new(),
                    by_name: HashMap::default(),
                    network,
                    ram_used: 0,
                    video_used: 0,
                    seq: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Request to display an image; the underlying bytes are fetched at most once
    /// per URL.
    ///
    /// Emits `ImageAdded` on the first attach for a URL and `Update` always.
    ///
    /// # Panics
    ///
    /// Panics if the controller has been shut down.
    pub fn request(&self, options: RequestOptions) -> RenderRequest {
        ControllerShared::request(&self.shared, options)
    }

    /// Detach a render request; an image left without requests is evicted.
    pub fn clear(&self, request: &RenderRequest) {
        request.clear();
    }

    /// Create (or look up) a named bucket.
    ///
    /// # Panics
    ///
    /// Panics if the controller has been shut down.
    pub fn add_bucket(&self, name: &str, lock: bool) -> Bucket {
        let shared = self.shared.clone();
        shared.with_lock(|inner, _outbox| {
            assert!(!inner.closed, "controller has been shut down");
            let id = shared.ensure_bucket(inner, name, lock);
            shared.bucket_handle(inner, id)
        })
    }

    /// Look up a bucket by name.
    pub fn bucket(&self, name: &str) -> Option<Bucket> {
        let inner = self.shared.inner.lock();
        let id = *inner.by_name.get(name)?;
        Some(self.shared.bucket_handle(&inner, id))
    }

    /// Destroy a bucket: clear its requests, then drop it from the registry.
    pub fn remove_bucket(&self, name: &str) -> bool {
        let shared = self.shared.clone();
        ControllerShared::with_lock(&shared, |inner, outbox| {
            let Some(&id) = inner.by_name.get(name) else { return false };
            ControllerShared::clear_bucket_inner(&shared, inner, id, outbox);
            let bucket = inner.buckets.remove(&id);
            if let Some(bucket) = bucket {
                inner.by_name.remove(&bucket.name);
            }
            ControllerShared::settle(&shared, inner, outbox);
            true
        })
    }

    /// Look up the cached image for `url`.
    pub fn image(&self, url: &str) -> Option<Image> {
        let inner = self.shared.inner.lock();
        let id = *inner.by_url.get(url)?;
        let image = inner.images.get(&id)?;
        Some(Image {
            shared: self.shared.clone(),
            id,
            url: image.url.clone(),
            emitter: image.emitter.clone(),
        })
    }

    /// Subscribe to controller events.
    pub fn on<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ControllerEvent) + Send + Sync + 'static,
    {
        self.shared.emitter.on(handler)
    }

    /// Unsubscribe a handler.
    pub fn off(&self, id: HandlerId) -> bool {
        self.shared.emitter.off(id)
    }

    /// Current compressed plus decoded bytes over all images.
    pub fn ram_bytes_used(&self) -> u64 {
        self.shared.inner.lock().ram_used
    }

    /// Current decoded bytes over all requests whose image is decoded.
    pub fn video_bytes_used(&self) -> u64 {
        self.shared.inner.lock().video_used
    }

    /// Number of images in the registry.
    pub fn image_count(&self) -> usize {
        self.shared.inner.lock().images.len()
    }

    /// Number of images queued for loading.
    pub fn queued_loads(&self) -> usize {
        self.shared.inner.lock().network.queue_len()
    }

    /// Number of in-flight loaders.
    pub fn inflight_loads(&self) -> usize {
        self.shared.inner.lock().network.inflight_len()
    }

    /// The configuration this controller runs with.
    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Monotonic engine counters.
    pub fn statistics(&self) -> Arc<Statistics> {
        self.shared.statistics.clone()
    }

    /// Clear every bucket, then every image, then the loader pool. Idempotent.
    pub fn shutdown(&self) {
        ControllerShared::shutdown(&self.shared);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::test_utils::{controller_for_test, payload};

    const MB: u64 = 1 << 20;
    const KB600: usize = 600 * 1024;

    fn removed_urls(controller: &Controller) -> Arc<PlMutex<Vec<String>>> {
        let removed = Arc::new(PlMutex::new(Vec::new()));
        controller.on({
            let removed = removed.clone();
            move |event| {
                if let ControllerEvent::ImageRemoved { url } = event {
                    removed.lock().push(url.to_string());
                }
            }
        });
        removed
    }

    #[test_log::test]
    fn test_dedup_one_image_per_url() {
        let (controller, fetcher) = controller_for_test(8 * MB, 8 * MB, 4);
        let added = Arc::new(AtomicUsize::new(0));
        controller.on({
            let added = added.clone();
            move |event| {
                if matches!(event, ControllerEvent::ImageAdded { .. }) {
                    added.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        let bucket = controller.add_bucket("bucket1", false);
        let r1 = bucket.request("http://localhost/a.png", Extent::new(100, 100));
        let r2 = bucket.request("http://localhost/a.png", Extent::new(100, 100));

        assert_eq!(controller.image_count(), 1);
        assert_eq!(fetcher.dispatched(), 1);
        assert_eq!(added.load(Ordering::Relaxed), 1);
        assert_eq!(r1.state(), RequestState::ImagePending);
        assert_eq!(r2.state(), RequestState::ImagePending);

        let image = controller.image("http://localhost/a.png").unwrap();
        assert_eq!(image.request_count(), 2);
    }

    #[test_log::test]
    fn test_concurrency_cap() {
        let (controller, fetcher) = controller_for_test(64 * MB, 64 * MB, 2);
        let bucket = controller.add_bucket("grid", false);
        for i in 0..5 {
            bucket.request(format!("http://localhost/{i}.png"), Extent::new(10, 10));
        }

        assert_eq!(controller.inflight_loads(), 2);
        assert_eq!(controller.queued_loads(), 3);
        assert_eq!(fetcher.pending(), 2);

        // Every settled load frees a slot; the queue drains monotonically.
        for i in 0..5 {
            fetcher.complete(&format!("http://localhost/{i}.png"), &payload(10, 10, 100));
            assert!(controller.inflight_loads() <= 2);
        }
        assert_eq!(controller.inflight_loads(), 0);
        assert_eq!(controller.queued_loads(), 0);
        assert_eq!(controller.statistics().loads_completed(), 5);
    }

    #[test_log::test]
    fn test_eviction_least_recently_rendered_first() {
        let (controller, fetcher) = controller_for_test(MB, 64 * MB, 4);
        let removed = removed_urls(&controller);
        let bucket = controller.add_bucket("feed", false);
        let size = Extent::new(10, 10);

        let a = bucket.request("http://localhost/a.png", size);
        fetcher.complete("http://localhost/a.png", &payload(10, 10, KB600));
        a.mark_rendered();
        assert!(removed.lock().is_empty());

        let b = bucket.request("http://localhost/b.png", size);
        fetcher.complete("http://localhost/b.png", &payload(10, 10, KB600));
        // Loading B overflows RAM; A is the least recently rendered candidate.
        assert_eq!(removed.lock().clone(), vec!["http://localhost/a.png"]);
        assert_eq!(a.state(), RequestState::Cleared);
        assert!(controller.ram_bytes_used() <= MB);
        b.mark_rendered();

        let c = bucket.request("http://localhost/c.png", size);
        fetcher.complete("http://localhost/c.png", &payload(10, 10, KB600));
        c.mark_rendered();

        let d = bucket.request("http://localhost/d.png", size);
        assert!(fetcher.handle("http://localhost/d.png").is_some(), "D must begin loading");
        fetcher.complete("http://localhost/d.png", &payload(10, 10, KB600));

        assert_eq!(
            removed.lock().clone(),
            vec![
                "http://localhost/a.png",
                "http://localhost/b.png",
                "http://localhost/c.png"
            ]
        );
        assert!(controller.ram_bytes_used() <= MB);
        assert!(controller.image("http://localhost/d.png").is_some());
        assert_eq!(d.state(), RequestState::ImageLoaded);
    }

    #[test_log::test]
    fn test_locked_bucket_pins_content() {
        let (controller, fetcher) = controller_for_test(MB, 64 * MB, 4);
        let overflows = Arc::new(AtomicUsize::new(0));
        controller.on({
            let overflows = overflows.clone();
            move |event| {
                if matches!(event, ControllerEvent::RamOverflow { .. }) {
                    overflows.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        let pinned = controller.add_bucket("pinned", true);
        let a = pinned.request("http://localhost/a.png", Extent::new(10, 10));
        fetcher.complete("http://localhost/a.png", &payload(10, 10, KB600));
        a.mark_rendered();

        let other = controller.add_bucket("other", true);
        other.request("http://localhost/d.png", Extent::new(10, 10));
        fetcher.complete("http://localhost/d.png", &payload(10, 10, KB600));

        // A stays even though it is the LRU candidate; with no unlocked candidate
        // the controller reports overflow instead of evicting locked content.
        assert_eq!(controller.image_count(), 2);
        assert!(controller.image("http://localhost/a.png").unwrap().is_live());
        assert!(controller.ram_bytes_used() > MB);
        assert!(overflows.load(Ordering::Relaxed) >= 1);
        assert_eq!(a.state(), RequestState::Rendered);
    }

    #[test_log::test]
    fn test_multi_size_video_accounting() {
        let (controller, fetcher) = controller_for_test(64 * MB, 64 * MB, 4);
        let bucket = controller.add_bucket("gallery", false);

        let small = bucket.request("http://localhost/u.png", Extent::new(100, 100));
        let large = bucket.request("http://localhost/u.png", Extent::new(200, 200));
        fetcher.complete("http://localhost/u.png", &payload(50, 40, 2000));
        small.mark_rendered();
        large.mark_rendered();

        assert_eq!(controller.video_bytes_used(), 100 * 100 * 4 + 200 * 200 * 4);
        // RAM counts the compressed payload plus the decoded estimate at the
        // natural dimensions.
        assert_eq!(controller.ram_bytes_used(), 2000 + 50 * 40 * 4);
        assert_eq!(controller.image_count(), 1);
    }

    #[test_log::test]
    fn test_cancellation_during_fetch() {
        let (controller, fetcher) = controller_for_test(64 * MB, 64 * MB, 4);
        let bucket = controller.add_bucket("page", false);

        let request = bucket.request("http://localhost/a.png", Extent::new(10, 10));
        let handle = fetcher.handle("http://localhost/a.png").unwrap();

        let clears = Arc::new(AtomicUsize::new(0));
        controller.image("http://localhost/a.png").unwrap().on({
            let clears = clears.clone();
            move |event| {
                if matches!(event, ImageEvent::Clear) {
                    clears.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        bucket.clear();

        assert!(handle.is_aborted());
        assert!(handle.is_terminal());
        assert_eq!(clears.load(Ordering::Relaxed), 1);
        assert_eq!(request.state(), RequestState::Cleared);
        assert_eq!(controller.image_count(), 0);
        assert_eq!(controller.queued_loads(), 0);
        assert_eq!(controller.inflight_loads(), 0);
        assert_eq!(controller.statistics().loads_completed(), 0);
        assert_eq!(controller.statistics().loads_errored(), 0);

        // A late payload from the transport is dropped by the loader contract.
        handle.loaded(Bytes::from_static(b"10x10|late"));
        assert_eq!(controller.statistics().loads_completed(), 0);
        assert_eq!(controller.image_count(), 0);
    }

    #[test_log::test]
    fn test_register_unregister_roundtrip() {
        let (controller, _fetcher) = controller_for_test(64 * MB, 64 * MB, 4);
        let bucket = controller.add_bucket("b", false);

        let request = bucket.request("http://localhost/a.png", Extent::new(10, 10));
        request.clear();
        request.clear();

        assert_eq!(controller.image_count(), 0);
        assert_eq!(controller.queued_loads(), 0);
        assert_eq!(controller.inflight_loads(), 0);
        assert_eq!(controller.ram_bytes_used(), 0);
        assert_eq!(controller.video_bytes_used(), 0);
        assert!(bucket.is_empty());
    }

    #[test_log::test]
    fn test_overflow_pauses_dispatch_and_resumes() {
        let (controller, fetcher) = controller_for_test(1000, 64 * MB, 4);
        let locked = controller.add_bucket("locked", true);
        locked.request("http://localhost/a.png", Extent::new(4, 4));
        fetcher.complete("http://localhost/a.png", &payload(4, 4, 1500));

        // Over budget with only locked content: dispatch pauses, requests queue.
        let open = controller.add_bucket("open", false);
        open.request("http://localhost/d.png", Extent::new(4, 4));
        assert_eq!(controller.queued_loads(), 1);
        assert!(fetcher.handle("http://localhost/d.png").is_none());

        // Clearing the locked bucket frees space; dispatch resumes naturally.
        locked.clear();
        assert!(fetcher.handle("http://localhost/d.png").is_some());
        assert_eq!(controller.queued_loads(), 0);
    }

    #[test_log::test]
    fn test_load_error_propagates() {
        let (controller, fetcher) = controller_for_test(64 * MB, 64 * MB, 4);
        let bucket = controller.add_bucket("b", false);
        let request = bucket.request("http://localhost/a.png", Extent::new(10, 10));

        let request_errors = Arc::new(AtomicUsize::new(0));
        request.on({
            let request_errors = request_errors.clone();
            move |event| {
                if matches!(event, RequestEvent::Error { .. }) {
                    request_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        let bucket_errors = Arc::new(AtomicUsize::new(0));
        bucket.on({
            let bucket_errors = bucket_errors.clone();
            move |event| {
                if matches!(event, BucketEvent::Error { .. }) {
                    bucket_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        fetcher.fail("http://localhost/a.png", LoadError::Network { reason: "boom".into() });

        assert_eq!(request_errors.load(Ordering::Relaxed), 1);
        assert_eq!(bucket_errors.load(Ordering::Relaxed), 1);
        assert_eq!(controller.statistics().loads_errored(), 1);
        // The image survives unloaded; a new request re-enqueues it.
        assert!(controller.image("http://localhost/a.png").is_some());
        bucket.request("http://localhost/a.png", Extent::new(10, 10));
        assert!(fetcher.handle("http://localhost/a.png").is_some());
    }

    #[test_log::test]
    fn test_blob_error_propagates() {
        let (controller, fetcher) = controller_for_test(64 * MB, 64 * MB, 4);
        let bucket = controller.add_bucket("b", false);
        let request = bucket.request("http://localhost/a.png", Extent::new(10, 10));

        let blob_errors = Arc::new(AtomicUsize::new(0));
        controller.image("http://localhost/a.png").unwrap().on({
            let blob_errors = blob_errors.clone();
            move |event| {
                if matches!(event, ImageEvent::BlobError { .. }) {
                    blob_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        let decode_errors = Arc::new(AtomicUsize::new(0));
        bucket.on({
            let decode_errors = decode_errors.clone();
            move |event| {
                if matches!(event, BucketEvent::Error { error: LoadError::Decode { .. }, .. }) {
                    decode_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        fetcher.complete("http://localhost/a.png", b"garbage, not a bitmap");

        assert_eq!(blob_errors.load(Ordering::Relaxed), 1);
        assert_eq!(decode_errors.load(Ordering::Relaxed), 1);
        // Bytes are cached, but the request never becomes paintable.
        assert_eq!(request.state(), RequestState::ImagePending);
        assert!(controller.image("http://localhost/a.png").unwrap().is_loaded());
    }

    #[test_log::test]
    fn test_bucket_progress_counts_image_once() {
        let (controller, fetcher) = controller_for_test(64 * MB, 64 * MB, 4);
        let bucket = controller.add_bucket("b", false);
        bucket.request("http://localhost/a.png", Extent::new(10, 10));
        bucket.request("http://localhost/a.png", Extent::new(20, 20));
        bucket.request("http://localhost/b.png", Extent::new(10, 10));

        let a = fetcher.handle("http://localhost/a.png").unwrap();
        let b = fetcher.handle("http://localhost/b.png").unwrap();
        a.started(Some(1000));
        b.started(Some(1000));
        a.progress(500, Some(1000));
        b.progress(250, Some(1000));

        // a.png appears twice in the bucket but is counted once.
        assert!((bucket.progress() - 0.375).abs() < 1e-9);

        let loadends = Arc::new(AtomicUsize::new(0));
        bucket.on({
            let loadends = loadends.clone();
            move |event| {
                if matches!(event, BucketEvent::LoadEnd) {
                    loadends.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        a.loaded(Bytes::from(payload(10, 10, 1000)));
        assert_eq!(loadends.load(Ordering::Relaxed), 0);
        b.loaded(Bytes::from(payload(10, 10, 1000)));
        assert_eq!(loadends.load(Ordering::Relaxed), 1);
        assert!((bucket.progress() - 1.0).abs() < 1e-9);
    }

    #[test_log::test]
    fn test_unlock_restores_pins() {
        let (controller, fetcher) = controller_for_test(64 * MB, 64 * MB, 4);
        let bucket = controller.add_bucket("b", false);
        let pinned = bucket.request("http://localhost/a.png", Extent::new(10, 10));
        pinned.pin();
        let plain = bucket.request("http://localhost/b.png", Extent::new(10, 10));
        fetcher.complete("http://localhost/a.png", &payload(10, 10, 100));
        fetcher.complete("http://localhost/b.png", &payload(10, 10, 100));

        assert!(pinned.is_locked());
        assert!(!plain.is_locked());

        bucket.lock();
        assert!(pinned.is_locked());
        assert!(plain.is_locked());
        assert!(controller.image("http://localhost/b.png").unwrap().is_locked());

        bucket.unlock();
        assert!(pinned.is_locked());
        assert!(!plain.is_locked());
    }

    #[test_log::test]
    fn test_video_eviction_prefers_invisible_multi_size() {
        let (controller, fetcher) = controller_for_test(64 * MB, 150_000, 4);
        let bucket = controller.add_bucket("b", false);
        let small = bucket.request("http://localhost/u.png", Extent::new(100, 100));
        let large = bucket
            .request("http://localhost/u.png", Extent::new(200, 200));
        large.set_visible(false);
        fetcher.complete("http://localhost/u.png", &payload(10, 10, 100));

        small.mark_rendered();

        // 200_000 bytes of video against a 150_000 budget: the invisible extent of
        // the multi-size image is torn down, the rendered one survives.
        assert_eq!(controller.video_bytes_used(), 40_000);
        assert_eq!(large.state(), RequestState::Cleared);
        assert_eq!(small.state(), RequestState::Rendered);
        assert_eq!(controller.statistics().requests_evicted(), 1);
        assert!(controller.image("http://localhost/u.png").unwrap().is_live());
    }

    #[test_log::test]
    fn test_bucket_rendered_event() {
        let (controller, fetcher) = controller_for_test(64 * MB, 64 * MB, 4);
        let bucket = controller.add_bucket("b", false);
        let r1 = bucket.request("http://localhost/a.png", Extent::new(10, 10));
        let r2 = bucket.request("http://localhost/b.png", Extent::new(10, 10));
        fetcher.complete("http://localhost/a.png", &payload(10, 10, 100));
        fetcher.complete("http://localhost/b.png", &payload(10, 10, 100));

        let rendered = Arc::new(AtomicUsize::new(0));
        bucket.on({
            let rendered = rendered.clone();
            move |event| {
                if matches!(event, BucketEvent::Rendered) {
                    rendered.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        r1.mark_rendered();
        assert_eq!(rendered.load(Ordering::Relaxed), 0);
        assert!((bucket.rendered_fraction() - 0.5).abs() < 1e-9);
        r2.mark_rendered();
        assert_eq!(rendered.load(Ordering::Relaxed), 1);
        assert!((bucket.rendered_fraction() - 1.0).abs() < 1e-9);
    }

    #[test_log::test]
    fn test_shutdown_empties_everything() {
        let (controller, fetcher) = controller_for_test(64 * MB, 64 * MB, 2);
        let bucket = controller.add_bucket("b", false);
        for i in 0..4 {
            bucket.request(format!("http://localhost/{i}.png"), Extent::new(10, 10));
        }
        fetcher.complete("http://localhost/0.png", &payload(10, 10, 100));
        let inflight = fetcher.handle("http://localhost/1.png").unwrap();

        controller.shutdown();

        assert_eq!(controller.image_count(), 0);
        assert_eq!(controller.queued_loads(), 0);
        assert_eq!(controller.inflight_loads(), 0);
        assert_eq!(controller.ram_bytes_used(), 0);
        assert_eq!(controller.video_bytes_used(), 0);
        assert!(inflight.is_aborted());
        assert!(controller.bucket("b").is_none());

        controller.shutdown();
    }

    #[test]
    #[should_panic(expected = "controller has been shut down")]
    fn test_request_after_shutdown_panics() {
        let (controller, _fetcher) = controller_for_test(64 * MB, 64 * MB, 4);
        controller.shutdown();
        controller.request(RequestOptions::new("http://localhost/a.png", Extent::new(1, 1), "b"));
    }

    #[test_log::test]
    fn test_remove_bucket_clears_requests() {
        let (controller, fetcher) = controller_for_test(64 * MB, 64 * MB, 4);
        let bucket = controller.add_bucket("b", false);
        let request = bucket.request("http://localhost/a.png", Extent::new(10, 10));
        fetcher.complete("http://localhost/a.png", &payload(10, 10, 100));

        assert!(controller.remove_bucket("b"));
        assert!(!controller.remove_bucket("b"));
        assert!(controller.bucket("b").is_none());
        assert_eq!(request.state(), RequestState::Cleared);
        assert_eq!(controller.image_count(), 0);
    }
}

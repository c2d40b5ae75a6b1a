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
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use salon_common::event::Emitter;
use tokio::sync::Notify;

use crate::fetch::FetchJob;

/// Failure taxonomy for one image load.
///
/// Failures are published as events, never raised as panics or `Err` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Connection failure, non-2xx response, or response parse failure.
    Network {
        /// Human-readable failure reason.
        reason: String,
    },
    /// The configured loader deadline elapsed.
    Timeout,
    /// The load was cancelled.
    Aborted,
    /// Bytes were fetched but are not decodable as an image.
    Decode {
        /// Human-readable failure reason.
        reason: String,
    },
}

impl Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Network { reason } => write!(f, "network error: {reason}"),
            LoadError::Timeout => write!(f, "timeout"),
            LoadError::Aborted => write!(f, "aborted"),
            LoadError::Decode { reason } => write!(f, "decode error: {reason}"),
        }
    }
}

/// Events of a single [`Loader`].
///
/// A loader emits `Start`, zero or more `Progress`, and exactly one of the terminal
/// events `Load`, `Error`, `Timeout`, or `Abort`. Nothing is emitted after a
/// terminal event.
#[derive(Debug, Clone)]
pub enum LoaderEvent {
    /// The fetch began. `total` is the expected byte count if the transport knows it.
    Start {
        /// Expected total byte count, if known.
        total: Option<u64>,
    },
    /// Bytes arrived.
    Progress {
        /// Bytes received so far.
        loaded: u64,
        /// Expected total byte count, if known.
        total: Option<u64>,
    },
    /// Terminal: the fetch completed with the full payload.
    Load {
        /// The fetched payload.
        bytes: Bytes,
    },
    /// Terminal: the fetch failed.
    Error {
        /// The failure.
        error: LoadError,
    },
    /// Terminal: the loader deadline elapsed.
    Timeout,
    /// Terminal: the loader was aborted.
    Abort,
}

/// Coarse phase of a loader, exposed for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderPhase {
    /// Created but the transport has not reported `Start` yet.
    Pending,
    /// `Start` has been emitted.
    Started,
    /// A terminal event has been emitted.
    Terminal,
}

struct LoaderShared {
    job: FetchJob,
    phase: Mutex<LoaderPhase>,
    aborted: AtomicBool,
    notify: Notify,
    emitter: Emitter<LoaderEvent>,
}

impl LoaderShared {
    /// Transition to `Terminal` and emit `event`; no-op once terminal.
    fn terminal(&self, event: LoaderEvent) -> bool {
        {
            let mut phase = self.phase.lock();
            if *phase == LoaderPhase::Terminal {
                return false;
            }
            *phase = LoaderPhase::Terminal;
        }
        self.emitter.emit(&event);
        true
    }
}

/// A one-shot byte fetch for a URL.
///
/// The loader owns the event contract; the byte transport behind it only ever talks
/// through a [`LoaderHandle`], which drops out-of-order or post-terminal reports.
/// Loaders do not retry; retry policy lives above.
pub struct Loader {
    shared: Arc<LoaderShared>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("url", &self.shared.job.url)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Clone for Loader {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Loader {
    /// Create a loader for `job`.
    pub fn new(job: FetchJob) -> Self {
        Self {
            shared: Arc::new(LoaderShared {
                job,
                phase: Mutex::new(LoaderPhase::Pending),
                aborted: AtomicBool::new(false),
                notify: Notify::new(),
                emitter: Emitter::new(),
            }),
        }
    }

    /// The fetch job this loader runs.
    pub fn job(&self) -> &FetchJob {
        &self.shared.job
    }

    /// The loader event emitter.
    pub fn events(&self) -> &Emitter<LoaderEvent> {
        &self.shared.emitter
    }

    /// The handle handed to the byte transport.
    pub fn handle(&self) -> LoaderHandle {
        LoaderHandle {
            shared: self.shared.clone(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> LoaderPhase {
        *self.shared.phase.lock()
    }

    /// Cancel the fetch.
    ///
    /// Emits `Abort` unless a terminal event already fired. Idempotent.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        self.shared.terminal(LoaderEvent::Abort);
    }
}

/// The reporting side of a [`Loader`], held by the byte transport.
///
/// The handle enforces the loader contract: `started` is accepted once, `progress`
/// only between `started` and a terminal report, and exactly one terminal report
/// wins. Everything else is dropped silently, so a late transport task cannot
/// corrupt the event stream.
pub struct LoaderHandle {
    shared: Arc<LoaderShared>,
}

impl std::fmt::Debug for LoaderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderHandle").field("url", &self.shared.job.url).finish()
    }
}

impl Clone for LoaderHandle {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl LoaderHandle {
    /// The fetch job this handle reports for.
    pub fn job(&self) -> &FetchJob {
        &self.shared.job
    }

    /// Report that the fetch began.
    pub fn started(&self, total: Option<u64>) {
        {
            let mut phase = self.shared.phase.lock();
            if *phase != LoaderPhase::Pending {
                return;
            }
            *phase = LoaderPhase::Started;
        }
        self.shared.emitter.emit(&LoaderEvent::Start { total });
    }

    /// Report download progress.
    pub fn progress(&self, loaded: u64, total: Option<u64>) {
        if *self.shared.phase.lock() != LoaderPhase::Started {
            return;
        }
        self.shared.emitter.emit(&LoaderEvent::Progress { loaded, total });
    }

    /// Report the terminal payload.
    pub fn loaded(&self, bytes: Bytes) {
        self.shared.terminal(LoaderEvent::Load { bytes });
    }

    /// Report a terminal failure.
    pub fn failed(&self, error: LoadError) {
        let event = match error {
            LoadError::Timeout => LoaderEvent::Timeout,
            LoadError::Aborted => {
                self.shared.aborted.store(true, Ordering::SeqCst);
                LoaderEvent::Abort
            }
            error => LoaderEvent::Error { error },
        };
        self.shared.terminal(event);
    }

    /// Returns `true` once the loader has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Returns `true` once a terminal event fired.
    pub fn is_terminal(&self) -> bool {
        *self.shared.phase.lock() == LoaderPhase::Terminal
    }

    /// Resolve when the loader is aborted.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.shared.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

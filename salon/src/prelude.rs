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

//! The public API of the salon image cache.

pub use crate::{
    cache::{
        bucket::{Bucket, BucketEvent},
        config::{ControllerBuilder, ControllerConfig},
        controller::{Controller, ControllerEvent, RequestOptions},
        decode::{BitmapProbe, Decoder},
        fetch::{FetchJob, Fetcher, HttpFetcher, DEFAULT_LOADER_TIMEOUT},
        image::{Image, ImageEvent},
        loader::{LoadError, Loader, LoaderEvent, LoaderHandle, LoaderPhase},
        request::{Extent, RenderRequest, RequestEvent, RequestState},
        statistics::Statistics,
    },
    common::{
        error::{Error, ErrorKind, Result},
        event::{Emitter, HandlerId},
    },
};

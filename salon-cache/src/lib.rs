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

//! The salon cache engine.
//!
//! The engine coordinates the loading, decoding, and on-screen rendering of many
//! images under strict memory budgets:
//!
//! - a [`controller::Controller`] owns every image and bucket and runs eviction to
//!   hold compressed (RAM) and decoded (video) memory under configured ceilings;
//! - a [`network::Network`] dispatches at most `loaders_max` concurrent
//!   [`loader::Loader`]s and pauses under memory overflow;
//! - an [`image::Image`] caches the bytes of one source URL at most once;
//! - a [`request::RenderRequest`] binds an image to a pixel size within a
//!   [`bucket::Bucket`], and its lock state pins content against eviction.
//!
//! All lifecycle transitions are published as tagged events through per-entity
//! emitters; the engine never returns errors during normal operation.

pub mod bucket;
pub mod config;
pub mod controller;
pub mod decode;
pub mod fetch;
pub mod image;
pub mod loader;
pub mod network;
pub mod request;
pub mod statistics;
pub mod test_utils;

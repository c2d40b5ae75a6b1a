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

use std::io::Cursor;

use salon_common::error::{Error, Result};

/// Reports the natural pixel dimensions of a fetched byte payload.
///
/// This is the salon rendition of the hidden bitmap element a browser cache would
/// use to learn an image's natural size: the blob is probed for dimensions only,
/// never rasterized by the cache itself.
pub trait Decoder: Send + Sync + 'static {
    /// Probe the natural `(width, height)` of the encoded image in `blob`.
    fn dimensions(&self, blob: &[u8]) -> Result<(u32, u32)>;
}

/// Default [`Decoder`] backed by the `image` crate.
///
/// Sniffs the container format from the payload and reads the dimensions from the
/// header without decoding pixel data.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitmapProbe;

impl Decoder for BitmapProbe {
    fn dimensions(&self, blob: &[u8]) -> Result<(u32, u32)> {
        let reader = ::image::ImageReader::new(Cursor::new(blob))
            .with_guessed_format()
            .map_err(|e| Error::decode("cannot sniff image format").caused_by(e))?;
        reader
            .into_dimensions()
            .map_err(|e| Error::decode("cannot read image dimensions").caused_by(e))
    }
}

#[cfg(test)]
mod tests {
    use salon_common::error::ErrorKind;

    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        ::image::RgbaImage::new(width, height)
            .write_to(&mut Cursor::new(&mut buf), ::image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_probe_png_dimensions() {
        let blob = png(3, 2);
        assert_eq!(BitmapProbe.dimensions(&blob).unwrap(), (3, 2));
    }

    #[test]
    fn test_probe_rejects_garbage() {
        let err = BitmapProbe.dimensions(b"definitely not an image").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }
}

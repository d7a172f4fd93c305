//! Vertical slicing of tall captures into fixed-height segments
//!
//! The window arithmetic lives in [`segment_windows`] and is independent of
//! any image data; [`segment`] applies those windows to an encoded image.

use crate::{OutputFormat, PipelineError};
use std::io::Cursor;

/// One horizontal slice of a source image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSegment {
    /// Zero-based position of the slice, top to bottom
    pub index: usize,
    /// First pixel row of the slice in the source image
    pub top_offset: u32,
    /// Number of pixel rows in the slice
    pub height: u32,
    /// Encoded image bytes of the slice
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentWindow {
    pub index: usize,
    pub top_offset: u32,
    pub height: u32,
}

/// Lazy top-to-bottom windows covering `[0, source_height)`.
#[derive(Debug, Clone)]
pub struct SegmentWindows {
    source_height: u32,
    segment_height: u32,
    next_top: u32,
    next_index: usize,
}

impl Iterator for SegmentWindows {
    type Item = SegmentWindow;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_top >= self.source_height {
            return None;
        }
        let height = self.segment_height.min(self.source_height - self.next_top);
        let window = SegmentWindow {
            index: self.next_index,
            top_offset: self.next_top,
            height,
        };
        self.next_top += height;
        self.next_index += 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.source_height - self.next_top.min(self.source_height)) as u64;
        let count = remaining.div_ceil(self.segment_height as u64) as usize;
        (count, Some(count))
    }
}

impl ExactSizeIterator for SegmentWindows {}

/// Windows of `segment_height` rows over an image `source_height` rows tall;
/// the last window holds the remainder. A zero `segment_height` is treated as 1.
pub fn segment_windows(source_height: u32, segment_height: u32) -> SegmentWindows {
    SegmentWindows {
        source_height,
        segment_height: segment_height.max(1),
        next_top: 0,
        next_index: 0,
    }
}

/// Read width and height from the image header without decoding pixels.
pub fn image_dimensions(image_bytes: &[u8]) -> Result<(u32, u32), PipelineError> {
    image::io::Reader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::ImageDecodeError(e.to_string()))?
        .into_dimensions()
        .map_err(PipelineError::from)
}

/// Split an encoded image into segments of at most `segment_height` rows.
///
/// When one window covers the whole image the original bytes are returned
/// untouched as the single segment. Otherwise the image is decoded once and
/// each window is cropped and re-encoded in `format`.
pub fn segment(
    image_bytes: &[u8],
    segment_height: u32,
    format: OutputFormat,
) -> Result<Vec<ImageSegment>, PipelineError> {
    if segment_height == 0 {
        return Err(PipelineError::ConfigurationError(
            "segment height must be greater than 0".to_string(),
        ));
    }

    let (width, source_height) = image_dimensions(image_bytes)?;

    if segment_height >= source_height {
        return Ok(vec![ImageSegment {
            index: 0,
            top_offset: 0,
            height: source_height,
            bytes: image_bytes.to_vec(),
        }]);
    }

    let image = image::load_from_memory(image_bytes)?;

    segment_windows(source_height, segment_height)
        .map(|window| -> Result<ImageSegment, PipelineError> {
            let slice = image.crop_imm(0, window.top_offset, width, window.height);
            let mut bytes = Vec::new();
            slice.write_to(&mut Cursor::new(&mut bytes), format.image_format())?;
            Ok(ImageSegment {
                index: window.index,
                top_offset: window.top_offset,
                height: window.height,
                bytes,
            })
        })
        .collect()
}

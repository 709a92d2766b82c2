//! Non-owning segmentation of a firmware image.

use crate::error::{OtaError, OtaResult};

/// Mesh distribution packet size in bytes.
pub const SEGMENT_SIZE: usize = 1024;

/// Compute the `(offset, len)` bounds of every segment of an image.
///
/// # Errors
///
/// Rejects an empty image.
pub fn segment_bounds(size: usize) -> OtaResult<Vec<(usize, usize)>> {
    if size == 0 {
        return Err(OtaError::InvalidInput("empty firmware image"));
    }
    let count = size.div_ceil(SEGMENT_SIZE);
    let mut bounds = Vec::with_capacity(count);
    for index in 0..count {
        let offset = index * SEGMENT_SIZE;
        let len = SEGMENT_SIZE.min(size - offset);
        bounds.push((offset, len));
    }
    Ok(bounds)
}

/// A segmented view over a firmware buffer.
///
/// The segments borrow the buffer; nothing is copied and the view cannot
/// outlive the image it describes.
#[derive(Debug)]
pub struct FirmwareSegments<'a> {
    data: &'a [u8],
    bounds: Vec<(usize, usize)>,
}

impl<'a> FirmwareSegments<'a> {
    /// Segment a firmware image.
    ///
    /// # Errors
    ///
    /// Rejects an empty image.
    pub fn new(data: &'a [u8]) -> OtaResult<Self> {
        Ok(Self {
            data,
            bounds: segment_bounds(data.len())?,
        })
    }

    /// Rebuild a view from previously computed bounds.
    pub(crate) fn from_bounds(data: &'a [u8], bounds: Vec<(usize, usize)>) -> Self {
        Self { data, bounds }
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Whether there are no segments.
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// One segment slice.
    pub fn get(&self, index: usize) -> Option<&'a [u8]> {
        self.bounds
            .get(index)
            .map(|&(offset, len)| &self.data[offset..offset + len])
    }

    /// Iterate over the segment slices in order.
    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.bounds
            .iter()
            .map(|&(offset, len)| &self.data[offset..offset + len])
    }

    /// The `(offset, len)` descriptor list.
    pub fn bounds(&self) -> &[(usize, usize)] {
        &self.bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_multiple_yields_equal_segments() {
        let image = vec![0xAB; SEGMENT_SIZE * 4];
        let segments = FirmwareSegments::new(&image).unwrap();
        assert_eq!(segments.len(), 4);
        assert!(segments.iter().all(|s| s.len() == SEGMENT_SIZE));
    }

    #[test]
    fn one_extra_byte_yields_a_trailing_singleton() {
        let image = vec![0xCD; SEGMENT_SIZE * 4 + 1];
        let segments = FirmwareSegments::new(&image).unwrap();
        assert_eq!(segments.len(), 5);
        assert_eq!(segments.get(4).unwrap().len(), 1);
    }

    #[test]
    fn concatenated_segments_equal_the_image() {
        let image: Vec<u8> = (0..2_500u32).map(|i| i as u8).collect();
        let segments = FirmwareSegments::new(&image).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments.get(0).unwrap().len(), 1024);
        assert_eq!(segments.get(1).unwrap().len(), 1024);
        assert_eq!(segments.get(2).unwrap().len(), 452);

        let rebuilt: Vec<u8> = segments.iter().flatten().copied().collect();
        assert_eq!(rebuilt, image);
    }

    #[test]
    fn empty_image_is_rejected() {
        assert!(matches!(
            FirmwareSegments::new(&[]),
            Err(OtaError::InvalidInput(_))
        ));
    }
}

//! The spare-area format written alongside each page.
//!
//! Each physical page's spare area is laid out as:
//!
//! ```text
//! +-------+------------------+-----------+-----------+-----+----------+
//! | count | base (8 bytes)   | ext 0     | ext 1     | ... | 0xFF pad |
//! +-------+------------------+-----------+-----------+-----+----------+
//! ```
//!
//! A virtual page spans one physical page per plane. The base is duplicated into every plane,
//! while the metadata extensions are divided evenly between the planes, so each physical spare
//! area records only its own share in `count`.

use super::{PageUtil, PlaneMask};

pub const SPARE_BASE_LEN: usize = 8;
pub const META_EXT_LEN: usize = 8;

/// The spare data of one virtual page
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SpareBuf {
    pub base: [u8; SPARE_BASE_LEN],
    pub meta_ext: Vec<[u8; META_EXT_LEN]>,
}

impl Default for SpareBuf {
    fn default() -> Self {
        Self {
            base: [0xFF; SPARE_BASE_LEN],
            meta_ext: Vec::new(),
        }
    }
}

impl SpareBuf {
    pub const HEADER_LEN: usize = 1 + SPARE_BASE_LEN;

    pub fn new(base: [u8; SPARE_BASE_LEN]) -> Self {
        Self {
            base,
            meta_ext: Vec::new(),
        }
    }

    /// Append a metadata extension
    pub fn meta_ext(mut self, ext: [u8; META_EXT_LEN]) -> Self {
        self.meta_ext.push(ext);
        self
    }

    /// How many extensions fit in one physical spare area
    pub fn max_meta_ext(spare_size: usize) -> usize {
        spare_size.saturating_sub(Self::HEADER_LEN) / META_EXT_LEN
    }

    /// Can this buffer be stored in a virtual page with the given layout?
    pub fn fits(&self, planes: u32, spare_size: usize) -> bool {
        self.meta_ext.len() <= Self::max_meta_ext(spare_size) * planes as usize
    }

    /// The part of this buffer stored in one plane's spare area.
    ///
    /// The result is a fresh buffer holding the base and that plane's share of the extensions,
    /// so its extension count is correct for a single physical page.
    pub fn plane_view(&self, plane: u32, planes: u32) -> SpareBuf {
        let share = self.meta_ext.len().div_ceil(planes as usize);
        let start = std::cmp::min(share * plane as usize, self.meta_ext.len());
        let end = std::cmp::min(start + share, self.meta_ext.len());

        SpareBuf {
            base: self.base,
            meta_ext: self.meta_ext[start..end].to_vec(),
        }
    }

    /// Reassemble a virtual-page buffer from per-plane views, in plane order
    pub fn join<I: IntoIterator<Item = SpareBuf>>(views: I) -> Self {
        let mut views = views.into_iter();
        let Some(mut joined) = views.next() else {
            return Self::default();
        };
        for view in views {
            joined.meta_ext.extend(view.meta_ext);
        }
        joined
    }

    /// Write into one physical spare area
    pub fn encode(&self, out: &mut [u8]) -> Result<(), &'static str> {
        let len = Self::HEADER_LEN + META_EXT_LEN * self.meta_ext.len();
        if out.len() < len {
            return Err("spare area too small for metadata extensions");
        }

        out.fill(0xFF);
        out[0] = self.meta_ext.len() as u8;
        out[1..Self::HEADER_LEN].copy_from_slice(&self.base);
        for (ext, chunk) in self
            .meta_ext
            .iter()
            .zip(out[Self::HEADER_LEN..].chunks_exact_mut(META_EXT_LEN))
        {
            chunk.copy_from_slice(ext);
        }
        Ok(())
    }

    /// Write the views for the planes in `mask` back to back, one spare area each
    pub fn encode_planes(
        &self,
        mask: PlaneMask,
        planes: u32,
        spare_size: usize,
    ) -> Result<Vec<u8>, &'static str> {
        let mut out = vec![0xFF; spare_size * mask.count() as usize];
        for (plane, chunk) in mask.iter().zip(out.chunks_exact_mut(spare_size)) {
            self.plane_view(plane, planes).encode(chunk)?;
        }
        Ok(out)
    }

    /// Convert from one physical spare area
    ///
    /// An erased spare area decodes to the default buffer.
    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.len() < Self::HEADER_LEN || bytes.is_erased() {
            return Self::default();
        }

        let mut base = [0u8; SPARE_BASE_LEN];
        base.copy_from_slice(&bytes[1..Self::HEADER_LEN]);

        let count = std::cmp::min(
            bytes[0] as usize,
            Self::max_meta_ext(bytes.len()),
        );
        let meta_ext = bytes[Self::HEADER_LEN..]
            .chunks_exact(META_EXT_LEN)
            .take(count)
            .map(|chunk| {
                let mut ext = [0u8; META_EXT_LEN];
                ext.copy_from_slice(chunk);
                ext
            })
            .collect();

        Self { base, meta_ext }
    }
}

#[test]
fn test_plane_view_splits_extensions() {
    let spare = SpareBuf::new(*b"BASEDATA")
        .meta_ext([1; META_EXT_LEN])
        .meta_ext([2; META_EXT_LEN])
        .meta_ext([3; META_EXT_LEN]);

    let plane0 = spare.plane_view(0, 2);
    let plane1 = spare.plane_view(1, 2);
    assert_eq!(plane0.base, spare.base);
    assert_eq!(plane1.base, spare.base);
    assert_eq!(plane0.meta_ext, [[1; META_EXT_LEN], [2; META_EXT_LEN]]);
    assert_eq!(plane1.meta_ext, [[3; META_EXT_LEN]]);

    assert_eq!(SpareBuf::join([plane0, plane1]), spare);
}

#[test]
fn test_spare_encode() -> anyhow::Result<()> {
    let spare = SpareBuf::new(*b"BASEDATA").meta_ext([7; META_EXT_LEN]);

    let mut bytes = [0u8; 32];
    spare.encode(&mut bytes).map_err(anyhow::Error::msg)?;
    assert_eq!(bytes[0], 1);
    assert!(bytes[SpareBuf::HEADER_LEN + META_EXT_LEN..].is_erased());
    assert_eq!(SpareBuf::decode(&bytes), spare);

    assert_eq!(SpareBuf::decode(&[0xFF; 32]), SpareBuf::default());

    let mut tiny = [0u8; 12];
    assert!(spare.encode(&mut tiny).is_err());
    Ok(())
}

#[test]
fn test_encode_planes() -> anyhow::Result<()> {
    let spare = SpareBuf::new(*b"ABCDEFGH")
        .meta_ext([1; META_EXT_LEN])
        .meta_ext([2; META_EXT_LEN]);

    let bytes = spare
        .encode_planes(PlaneMask::single(1), 2, 32)
        .map_err(anyhow::Error::msg)?;
    assert_eq!(bytes.len(), 32);
    assert_eq!(SpareBuf::decode(&bytes).meta_ext, [[2; META_EXT_LEN]]);
    Ok(())
}

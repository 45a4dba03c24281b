//! Pure layout math: mapping flat image byte ranges onto backing objects.
//!
//! An image is striped RAID0-style across fixed-size objects. `stripe_count`
//! consecutive objects form an object set; data is dealt out in
//! `stripe_unit`-sized blocks round-robin across the set before descending to
//! the next row of units. With `stripe_count == 1` this degenerates to plain
//! chunking by `object_size`.

use std::collections::BTreeMap;

use anyhow::{ensure, Result};

/// A `(offset, length)` byte range over the flat image address space.
pub type ImageExtent = (u64, u64);

/// A contiguous byte range within one backing object.
///
/// `buffer_extents` back-maps the object bytes onto the caller's buffer: one
/// logical read may span several objects and still scatter into a single
/// contiguous buffer, and one object extent may serve several disjoint buffer
/// slices when striping interleaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectExtent {
    pub oid: String,
    pub object_no: u64,
    /// Byte offset within the object.
    pub offset: u64,
    pub length: u64,
    /// `(buffer_offset, length)` slices of the caller buffer, in object byte
    /// order.
    pub buffer_extents: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Size of each backing object in bytes. Must be a power of two.
    pub object_size: u64,
    /// Striping block size. Must evenly divide `object_size`.
    pub stripe_unit: u64,
    /// Number of objects data is striped across before descending.
    pub stripe_count: u64,
    /// Prefix for generated object names.
    pub object_prefix: String,
}

impl Layout {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.object_size.is_power_of_two(),
            "object size must be a nonzero power of two",
        );
        ensure!(
            self.stripe_unit != 0 && self.object_size % self.stripe_unit == 0,
            "stripe unit must be nonzero and divide the object size",
        );
        ensure!(self.stripe_count != 0, "stripe count must be nonzero");
        ensure!(!self.object_prefix.is_empty(), "object prefix must be set");
        Ok(())
    }

    pub fn object_name(&self, object_no: u64) -> String {
        format!("{}.{:016x}", self.object_prefix, object_no)
    }
}

/// Map the image byte range `[offset, offset + length)` onto object extents,
/// appending to `extents` keyed by object number.
///
/// `buffer_ofs` is the caller-buffer position of `offset`; repeated calls with
/// an advancing `buffer_ofs` accumulate a scatter map that reassembles several
/// image extents into one contiguous buffer. Extents contiguous in object
/// space are merged, as are their adjacent buffer slices.
pub fn file_to_extents(
    layout: &Layout,
    offset: u64,
    length: u64,
    mut buffer_ofs: u64,
    extents: &mut BTreeMap<u64, Vec<ObjectExtent>>,
) {
    let su = layout.stripe_unit;
    let sc = layout.stripe_count;
    let units_per_object = layout.object_size / su;

    let mut cur = offset;
    let mut left = length;
    while left > 0 {
        let block_no = cur / su;
        let block_off = cur % su;
        let stripe_no = block_no / sc;
        let stripe_pos = block_no % sc;
        let object_set = stripe_no / units_per_object;
        let object_no = object_set * sc + stripe_pos;
        let obj_off = (stripe_no % units_per_object) * su + block_off;
        let len = Ord::min(left, su - block_off);

        let object_extents = extents.entry(object_no).or_default();
        match object_extents
            .last_mut()
            .filter(|last| last.offset + last.length == obj_off)
        {
            Some(last) => {
                last.length += len;
                match last
                    .buffer_extents
                    .last_mut()
                    .filter(|(bo, bl)| *bo + *bl == buffer_ofs)
                {
                    Some((_, bl)) => *bl += len,
                    None => last.buffer_extents.push((buffer_ofs, len)),
                }
            }
            None => object_extents.push(ObjectExtent {
                oid: layout.object_name(object_no),
                object_no,
                offset: obj_off,
                length: len,
                buffer_extents: vec![(buffer_ofs, len)],
            }),
        }

        cur += len;
        left -= len;
        buffer_ofs += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn layout(object_size: u64, stripe_unit: u64, stripe_count: u64) -> Layout {
        Layout {
            object_size,
            stripe_unit,
            stripe_count,
            object_prefix: "img".to_owned(),
        }
    }

    fn map(layout: &Layout, ranges: &[(u64, u64)]) -> BTreeMap<u64, Vec<ObjectExtent>> {
        let mut extents = BTreeMap::new();
        let mut buffer_ofs = 0;
        for &(off, len) in ranges {
            file_to_extents(layout, off, len, buffer_ofs, &mut extents);
            buffer_ofs += len;
        }
        extents
    }

    #[test]
    fn validate_rejects_bad_layouts() {
        assert!(layout(4 * MIB, MIB, 1).validate().is_ok());
        assert!(layout(3 * MIB, MIB, 1).validate().is_err());
        assert!(layout(4 * MIB, 3, 1).validate().is_err());
        assert!(layout(4 * MIB, MIB, 0).validate().is_err());
    }

    #[test]
    fn split_across_two_objects() {
        // 2MiB read starting 1MiB before an object boundary.
        let layout = layout(4 * MIB, 4 * MIB, 1);
        let extents = map(&layout, &[(3 * MIB, 2 * MIB)]);

        assert_eq!(extents.len(), 2);
        assert_eq!(
            extents[&0],
            vec![ObjectExtent {
                oid: layout.object_name(0),
                object_no: 0,
                offset: 3 * MIB,
                length: MIB,
                buffer_extents: vec![(0, MIB)],
            }],
        );
        assert_eq!(
            extents[&1],
            vec![ObjectExtent {
                oid: layout.object_name(1),
                object_no: 1,
                offset: 0,
                length: MIB,
                buffer_extents: vec![(MIB, MIB)],
            }],
        );
    }

    #[test]
    fn contiguous_units_merge() {
        // Two stripe units landing back to back in the same object fold into
        // one extent with one buffer slice.
        let layout = layout(4 * MIB, MIB, 1);
        let extents = map(&layout, &[(0, 2 * MIB)]);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[&0].len(), 1);
        assert_eq!(extents[&0][0].length, 2 * MIB);
        assert_eq!(extents[&0][0].buffer_extents, vec![(0, 2 * MIB)]);
    }

    #[test]
    fn interleaved_striping() {
        // su=1MiB, sc=2: units alternate between objects 0 and 1.
        let layout = layout(4 * MIB, MIB, 2);
        let extents = map(&layout, &[(0, 4 * MIB)]);

        assert_eq!(extents.len(), 2);
        // Object 0 serves units 0 and 2, mapping buffer slices 0 and 2MiB.
        assert_eq!(extents[&0].len(), 1);
        assert_eq!(extents[&0][0].offset, 0);
        assert_eq!(extents[&0][0].length, 2 * MIB);
        assert_eq!(extents[&0][0].buffer_extents, vec![(0, MIB), (2 * MIB, MIB)]);
        assert_eq!(extents[&1][0].buffer_extents, vec![(MIB, MIB), (3 * MIB, MIB)]);
    }

    #[test]
    fn multiple_ranges_accumulate_buffer_offsets() {
        let layout = layout(4 * MIB, 4 * MIB, 1);
        let extents = map(&layout, &[(0, MIB), (8 * MIB, MIB)]);
        assert_eq!(extents[&0][0].buffer_extents, vec![(0, MIB)]);
        assert_eq!(extents[&2][0].buffer_extents, vec![(MIB, MIB)]);
    }

    #[test]
    fn unaligned_range() {
        let layout = layout(4 * MIB, 4 * MIB, 1);
        let extents = map(&layout, &[(4 * MIB - 512, 1024)]);
        assert_eq!(extents[&0][0].offset, 4 * MIB - 512);
        assert_eq!(extents[&0][0].length, 512);
        assert_eq!(extents[&1][0].offset, 0);
        assert_eq!(extents[&1][0].length, 512);
        assert_eq!(extents[&1][0].buffer_extents, vec![(512, 512)]);
    }
}

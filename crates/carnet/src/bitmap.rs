//! Helpers over the compressed identifier sets the indexers store.
//!
//! Identifiers are 64-bit, so the treemap flavour of roaring is used
//! everywhere. Iteration order of every bitmap is ascending; callers rely
//! on it.

use roaring::RoaringTreemap;

use crate::DocumentId;

/// The full identifier range `[0, bound)` as a bitmap.
pub fn universe(bound: DocumentId) -> RoaringTreemap {
    let mut bitmap = RoaringTreemap::new();
    if bound > 0 {
        bitmap.insert_range(0..bound);
    }
    bitmap
}

/// OR of all `bitmaps`; the empty input yields the empty bitmap.
pub fn union_all<I>(bitmaps: I) -> RoaringTreemap
where
    I: IntoIterator<Item = RoaringTreemap>,
{
    let mut union = RoaringTreemap::new();
    for bitmap in bitmaps {
        union |= bitmap;
    }
    union
}

/// AND of all `bitmaps`; the empty input yields the empty bitmap.
pub fn intersect_all<I>(bitmaps: I) -> RoaringTreemap
where
    I: IntoIterator<Item = RoaringTreemap>,
{
    let mut iter = bitmaps.into_iter();
    let Some(mut intersection) = iter.next() else { return RoaringTreemap::new() };
    for bitmap in iter {
        if intersection.is_empty() {
            break;
        }
        intersection &= bitmap;
    }
    intersection
}

/// Identifiers in `[0, bound)` that are not in `bitmap`.
pub fn complement(bitmap: &RoaringTreemap, bound: DocumentId) -> RoaringTreemap {
    universe(bound) - bitmap
}

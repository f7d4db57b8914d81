//! Tag addressing: wire-tag encoding and disjoint tag ranges.
//!
//! Tags are application-chosen non-negative integers used to match a send
//! to a specific receive among many concurrent operations between the same
//! pair of ranks. On transports without a native (rank, tag) envelope the
//! tag is combined with the sender rank into a 64-bit wire tag; "any
//! source" receives use a mask that ignores the embedded rank bits.

/// Peer rank within a process group.
pub type Rank = i32;

/// Application-visible message tag.
pub type Tag = i32;

/// Wildcard source rank for receives.
pub const ANY_SOURCE: Rank = -1;

/// Tags with this bit set belong to the reserved control range
/// (barrier sentinels). User tags must stay below it.
pub(crate) const RESERVED_TAG_BIT: Tag = 1 << 30;

/// Combine a tag and the sender rank into a 64-bit wire tag.
#[inline]
pub(crate) fn wire_tag(tag: Tag, rank: Rank) -> u64 {
    ((tag as u32 as u64) << 32) | (rank as u32 as u64)
}

/// Whether `tag` fits a transport whose user tag space ends at `limit`:
/// non-negative, with the payload bits below `limit` whether or not the
/// reserved control bit is set. Reserved tags get no extra payload room;
/// on transports with a narrow wire tag the payload would otherwise be
/// silently truncated into a colliding encoding.
#[inline]
pub(crate) fn tag_in_budget(tag: Tag, limit: Tag) -> bool {
    tag >= 0 && (tag & !RESERVED_TAG_BIT) < limit
}

/// Match every bit of the wire tag (exact-source receive).
pub(crate) const MATCH_EXACT: u64 = u64::MAX;

/// Ignore the embedded rank bits (any-source receive).
pub(crate) const MATCH_ANY_SOURCE: u64 = 0xffff_ffff_0000_0000;

/// Partitions a fixed-width tag space into disjoint sub-ranges so that
/// independent logical channels sharing one transport cannot collide.
///
/// The encoded layout is `x | r… | t…`: one reserved bit at the top of the
/// usable width, then enough bits to select the range, then the payload
/// tag bits. Wrapping happens before wire encoding, so every transport
/// honors the same range semantics.
#[derive(Debug, Clone, Copy)]
pub struct TagRangeFactory {
    n_ranges: u32,
    n_bits: u32,
    tag_bits: u32,
}

impl TagRangeFactory {
    /// Create a factory splitting `n_bits` of tag space into `n_ranges`
    /// disjoint ranges.
    ///
    /// Panics if the requested ranges do not fit below the reserved bit.
    pub fn new(n_ranges: u32, n_bits: u32) -> Self {
        assert!(n_ranges >= 1, "need at least one range");
        assert!(n_bits >= 2 && n_bits <= 63, "unusable tag-space width");
        let range_bits = if n_ranges <= 1 {
            0
        } else {
            usize::BITS - (n_ranges as usize - 1).leading_zeros()
        };
        assert!(
            n_bits > 1 + range_bits,
            "no payload bits left after reserved and range bits"
        );
        let tag_bits = n_bits - 1 - range_bits;
        Self {
            n_ranges,
            n_bits,
            tag_bits,
        }
    }

    /// Exclusive upper bound for tags wrappable by any range of this factory.
    pub fn max_tag(&self) -> Tag {
        1 << self.tag_bits
    }

    /// Number of ranges.
    pub fn n_ranges(&self) -> u32 {
        self.n_ranges
    }

    /// Create the `i`-th user range.
    pub fn create(&self, i: u32) -> TagRange {
        assert!(i < self.n_ranges, "range index out of bounds");
        TagRange {
            prefix: (i as u64) << self.tag_bits,
            tag_mask: (1u64 << self.tag_bits) - 1,
        }
    }

    /// Create the reserved control range (reserved bit set, range bits zero).
    pub fn reserved(&self) -> TagRange {
        TagRange {
            prefix: 1u64 << (self.n_bits - 1),
            tag_mask: (1u64 << self.tag_bits) - 1,
        }
    }
}

/// One disjoint sub-range of the tag space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRange {
    prefix: u64,
    tag_mask: u64,
}

impl TagRange {
    /// Encode a user tag into this range.
    ///
    /// Panics if the tag does not fit the payload bits.
    pub fn wrap(&self, tag: Tag) -> WrappedTag {
        assert!(tag >= 0, "tags must be non-negative");
        assert!(
            (tag as u64) <= self.tag_mask,
            "tag {} exceeds range payload width",
            tag
        );
        WrappedTag {
            value: self.prefix | tag as u64,
            tag_mask: self.tag_mask,
        }
    }

    /// Decode a wrapped tag back to the user tag.
    pub fn unwrap(&self, wrapped: WrappedTag) -> Tag {
        (wrapped.value & self.tag_mask) as Tag
    }
}

/// An encoded wire tag produced by [`TagRange::wrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrappedTag {
    value: u64,
    tag_mask: u64,
}

impl WrappedTag {
    /// The encoded value as it appears on the wire.
    pub fn get(&self) -> u64 {
        self.value
    }

    /// Recover the user tag.
    pub fn unwrap(&self) -> Tag {
        (self.value & self.tag_mask) as Tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tag_embeds_rank() {
        assert_eq!(wire_tag(1, 2), (1 << 32) | 2);
        assert_eq!(wire_tag(1, 2) & MATCH_ANY_SOURCE, wire_tag(1, 7) & MATCH_ANY_SOURCE);
        assert_ne!(wire_tag(1, 2) & MATCH_EXACT, wire_tag(1, 7) & MATCH_EXACT);
    }

    #[test]
    fn test_roundtrip() {
        let factory = TagRangeFactory::new(6, 23);
        for i in 0..6 {
            let range = factory.create(i);
            for t in [0, 1, 17, factory.max_tag() - 1] {
                assert_eq!(range.wrap(t).unwrap(), t);
                assert_eq!(range.unwrap(range.wrap(t)), t);
            }
        }
    }

    #[test]
    fn test_ranges_disjoint() {
        let factory = TagRangeFactory::new(6, 23);
        for i in 0..6 {
            for j in 0..6 {
                if i == j {
                    continue;
                }
                for t in [0, 3, factory.max_tag() - 1] {
                    assert_ne!(
                        factory.create(i).wrap(t).get(),
                        factory.create(j).wrap(t).get()
                    );
                }
            }
        }
    }

    #[test]
    fn test_reserved_range_disjoint_from_all() {
        let factory = TagRangeFactory::new(4, 24);
        let reserved = factory.reserved();
        for i in 0..4 {
            assert_ne!(reserved.wrap(5).get(), factory.create(i).wrap(5).get());
        }
        assert_eq!(reserved.wrap(5).unwrap(), 5);
    }

    #[test]
    fn test_bit_layout() {
        // 23 usable bits, 6 ranges -> 3 range bits, 19 payload bits.
        let factory = TagRangeFactory::new(6, 23);
        assert_eq!(factory.max_tag(), 1 << 19);
        assert_eq!(factory.create(1).wrap(0).get(), 1 << 19);
        assert_eq!(factory.reserved().wrap(0).get(), 1 << 22);
    }

    #[test]
    fn test_tag_budget_applies_to_reserved_payload() {
        let limit = 1 << 23;
        assert!(tag_in_budget(7, limit));
        assert!(tag_in_budget(RESERVED_TAG_BIT | 7, limit));
        assert!(tag_in_budget(RESERVED_TAG_BIT | (limit - 1), limit));
        assert!(!tag_in_budget(limit, limit));
        assert!(!tag_in_budget(RESERVED_TAG_BIT | limit, limit));
        assert!(!tag_in_budget(-1, limit));
    }

    #[test]
    #[should_panic]
    fn test_oversized_tag_rejected() {
        let factory = TagRangeFactory::new(2, 8);
        factory.create(0).wrap(factory.max_tag());
    }
}

//! Slot hashing and the fixed-width slot bitmap.

use shoal_common::error::{ShoalError, ShoalResult};
use shoal_common::ids::{CLUSTER_SLOTS, MAX_SLOT_ID, SlotId};

const BITMAP_WORDS: usize = CLUSTER_SLOTS / 64;

/// Returns the hash slot owning `key`.
///
/// Uses CRC16-XMODEM over the key bytes, masked into the slot space. When the
/// key carries a non-empty `{hash tag}`, only the tag bytes are hashed so
/// related keys can be pinned to one slot.
#[must_use]
pub fn key_slot(key: &[u8]) -> SlotId {
    let hashed = hash_tag(key).unwrap_or(key);
    crc16(hashed) & MAX_SLOT_ID
}

/// Extracts the `{...}` hash-tag subrange when present and non-empty.
fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|&byte| byte == b'{')?;
    let close = key[open + 1..].iter().position(|&byte| byte == b'}')?;
    if close == 0 {
        return None;
    }
    Some(&key[open + 1..open + 1 + close])
}

/// CRC16-XMODEM (poly 0x1021, init 0), the cluster keyspace hash.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x1021
            };
        }
    }
    crc
}

/// Fixed-width bitmap over the cluster slot space.
///
/// The bitmap handed to a migration sender is immutable for the lifetime of
/// that migration; mutation happens only while assembling the request.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SlotBitmap {
    words: [u64; BITMAP_WORDS],
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBitmap {
    /// Creates an empty bitmap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            words: [0; BITMAP_WORDS],
        }
    }

    /// Creates a bitmap with the given slots set.
    #[must_use]
    pub fn from_slots(slots: &[SlotId]) -> Self {
        let mut bitmap = Self::new();
        for &slot in slots {
            bitmap.set(slot);
        }
        bitmap
    }

    /// Sets one slot bit.
    pub fn set(&mut self, slot: SlotId) {
        debug_assert!(slot <= MAX_SLOT_ID);
        self.words[usize::from(slot) / 64] |= 1_u64 << (usize::from(slot) % 64);
    }

    /// Clears one slot bit.
    pub fn clear(&mut self, slot: SlotId) {
        debug_assert!(slot <= MAX_SLOT_ID);
        self.words[usize::from(slot) / 64] &= !(1_u64 << (usize::from(slot) % 64));
    }

    /// Returns whether one slot bit is set.
    #[must_use]
    pub fn contains(&self, slot: SlotId) -> bool {
        debug_assert!(slot <= MAX_SLOT_ID);
        self.words[usize::from(slot) / 64] & (1_u64 << (usize::from(slot) % 64)) != 0
    }

    /// Number of set slots.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    /// Returns whether no slot is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&word| word == 0)
    }

    /// Returns whether every slot set here is also set in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(mine, theirs)| mine & !theirs == 0)
    }

    /// Returns whether any slot is set in both bitmaps.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(mine, theirs)| mine & theirs != 0)
    }

    /// Iterates set slots in ascending index order.
    pub fn iter_set(&self) -> impl Iterator<Item = SlotId> + '_ {
        (0..CLUSTER_SLOTS)
            .map(|slot| slot as SlotId)
            .filter(|&slot| self.contains(slot))
    }

    /// Renders the bitmap as a fixed-length string of `'0'`/`'1'` characters.
    ///
    /// Slot `CLUSTER_SLOTS - 1` comes first, the order the destination's
    /// bit-string parser expects.
    #[must_use]
    pub fn to_bit_string(&self) -> String {
        let mut rendered = String::with_capacity(CLUSTER_SLOTS);
        for slot in (0..CLUSTER_SLOTS).rev() {
            rendered.push(if self.contains(slot as SlotId) {
                '1'
            } else {
                '0'
            });
        }
        rendered
    }

    /// Parses a bit string produced by [`SlotBitmap::to_bit_string`].
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Internal` when the string has the wrong length or
    /// contains characters other than `'0'`/`'1'`.
    pub fn from_bit_string(rendered: &str) -> ShoalResult<Self> {
        if rendered.len() != CLUSTER_SLOTS {
            return Err(ShoalError::Internal(format!(
                "slot bit string has length {}, expected {CLUSTER_SLOTS}",
                rendered.len()
            )));
        }
        let mut bitmap = Self::new();
        for (offset, character) in rendered.bytes().enumerate() {
            let slot = (CLUSTER_SLOTS - 1 - offset) as SlotId;
            match character {
                b'0' => {}
                b'1' => bitmap.set(slot),
                other => {
                    return Err(ShoalError::Internal(format!(
                        "invalid character {other:#04x} in slot bit string"
                    )));
                }
            }
        }
        Ok(bitmap)
    }
}

impl std::fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotBitmap")
            .field("count", &self.count())
            .field("slots", &self.iter_set().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{SlotBitmap, key_slot};
    use googletest::prelude::*;
    use rstest::rstest;
    use shoal_common::ids::{CLUSTER_SLOTS, MAX_SLOT_ID};

    #[rstest]
    #[case(b"".as_slice(), 0)]
    #[case(b"123456789".as_slice(), 0x31C3 & MAX_SLOT_ID)]
    fn key_slot_matches_reference_crc(#[case] key: &[u8], #[case] slot: u16) {
        assert_that!(key_slot(key), eq(slot));
    }

    #[rstest]
    fn key_slot_honors_hash_tags() {
        assert_that!(key_slot(b"user:{42}:name"), eq(key_slot(b"order:{42}")));
        assert_that!(key_slot(b"user:{42}:name"), eq(key_slot(b"42")));
    }

    #[rstest]
    #[case(b"no-tag".as_slice())]
    #[case(b"empty{}tag".as_slice())]
    #[case(b"open{only".as_slice())]
    fn key_slot_hashes_whole_key_without_usable_tag(#[case] key: &[u8]) {
        assert_that!(key_slot(key) <= MAX_SLOT_ID, eq(true));
    }

    #[rstest]
    fn bitmap_set_contains_and_count() {
        let mut bitmap = SlotBitmap::new();
        bitmap.set(0);
        bitmap.set(63);
        bitmap.set(64);
        bitmap.set(MAX_SLOT_ID);

        assert_that!(bitmap.count(), eq(4_usize));
        assert_that!(bitmap.contains(63), eq(true));
        assert_that!(bitmap.contains(1), eq(false));
        assert_that!(
            &bitmap.iter_set().collect::<Vec<_>>(),
            eq(&vec![0, 63, 64, MAX_SLOT_ID])
        );
    }

    #[rstest]
    fn bitmap_subset_and_intersection() {
        let small = SlotBitmap::from_slots(&[3, 7]);
        let large = SlotBitmap::from_slots(&[3, 7, 9]);
        let disjoint = SlotBitmap::from_slots(&[100]);

        assert_that!(small.is_subset(&large), eq(true));
        assert_that!(large.is_subset(&small), eq(false));
        assert_that!(small.intersects(&large), eq(true));
        assert_that!(small.intersects(&disjoint), eq(false));
    }

    #[rstest]
    fn bit_string_renders_highest_slot_first() {
        let bitmap = SlotBitmap::from_slots(&[0, MAX_SLOT_ID]);
        let rendered = bitmap.to_bit_string();

        assert_that!(rendered.len(), eq(CLUSTER_SLOTS));
        assert_that!(rendered.as_bytes()[0], eq(b'1'));
        assert_that!(rendered.as_bytes()[CLUSTER_SLOTS - 1], eq(b'1'));
        assert_that!(rendered.as_bytes()[1], eq(b'0'));
    }

    #[rstest]
    fn bit_string_roundtrip_preserves_bitmap() {
        let bitmap = SlotBitmap::from_slots(&[1, 500, 8_191, 16_000]);
        let parsed = SlotBitmap::from_bit_string(&bitmap.to_bit_string())
            .expect("rendered bit string should parse");
        assert_that!(&parsed, eq(&bitmap));
    }

    #[rstest]
    fn bit_string_rejects_bad_input() {
        assert_that!(SlotBitmap::from_bit_string("01").is_err(), eq(true));
        let mut rendered = SlotBitmap::new().to_bit_string();
        rendered.replace_range(0..1, "x");
        assert_that!(SlotBitmap::from_bit_string(&rendered).is_err(), eq(true));
    }
}

//! Generational post-write barrier
//!
//! After a reference is stored into a heap object, the object's header
//! decides what happens to the card table:
//!
//! | remembered set | unaligned | single store        | bulk store         |
//! |----------------|-----------|---------------------|--------------------|
//! | clear          | any       | nothing             | nothing            |
//! | set            | clear     | card of object      | card of object     |
//! | set            | set       | card of the write   | every card in range|
//!
//! Objects in aligned chunks are rescanned whole by the collector once their
//! starting card is dirty, so marking imprecisely is enough. Objects in
//! unaligned chunks can span thousands of cards; the collector scans only
//! dirty cards there, so the exact write location must be marked.
//!
//! The unaligned bit is read from the header on every store. It is never
//! cached, because an object's chunk kind is fixed only for its lifetime.

use crate::card_table::CardTable;
use crate::object::{Address, ObjectHeader, ObjectRef};

/// What a store requires of the card table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierAction {
    /// Object needs no remembering
    Skip,
    /// Dirty the card holding the object start
    Imprecise,
    /// Dirty the card holding this address
    Precise(Address),
    /// Dirty every card intersecting `[start, end)`
    Range(Address, Address),
}

/// Card-table action for a single reference store at `write`
#[inline(always)]
pub fn store_action(header: ObjectHeader, write: Address) -> BarrierAction {
    if !header.has_remembered_set() {
        BarrierAction::Skip
    } else if header.is_unaligned() {
        BarrierAction::Precise(write)
    } else {
        BarrierAction::Imprecise
    }
}

/// Card-table action for a bulk store covering `[start, end)`
#[inline]
pub fn range_action(header: ObjectHeader, start: Address, end: Address) -> BarrierAction {
    if !header.has_remembered_set() || start >= end {
        BarrierAction::Skip
    } else if header.is_unaligned() {
        BarrierAction::Range(start, end)
    } else {
        BarrierAction::Imprecise
    }
}

/// Apply `action` for `object`
#[inline(always)]
pub fn apply(cards: &CardTable, object: ObjectRef, action: BarrierAction) {
    match action {
        BarrierAction::Skip => {}
        BarrierAction::Imprecise => cards.mark_imprecise(object),
        BarrierAction::Precise(write) => cards.mark_precise(object, write),
        BarrierAction::Range(start, end) => cards.mark_range(object, start, end),
    }
}

/// Barrier after storing a reference at `write` inside `object`, expanded at
/// the call site
#[inline(always)]
pub fn post_write_inline(cards: &CardTable, object: ObjectRef, header: ObjectHeader, write: Address) {
    apply(cards, object, store_action(header, write));
}

/// Same as [`post_write_inline`], kept out of line to keep call sites small
#[inline(never)]
#[cold]
pub fn post_write_outlined(
    cards: &CardTable,
    object: ObjectRef,
    header: ObjectHeader,
    write: Address,
) {
    apply(cards, object, store_action(header, write));
}

/// Barrier after a bulk store into `[start, end)` inside `object`
#[inline(never)]
pub fn post_write_range(
    cards: &CardTable,
    object: ObjectRef,
    header: ObjectHeader,
    start: Address,
    end: Address,
) {
    apply(cards, object, range_action(header, start, end));
}

/// Dirtying applied to a fresh object with reference fields placed by the
/// slow path or bumped from an old TLAB, independent of its header bits.
///
/// The collector may already be scanning cards when the object appears, so
/// its reference region is reported unconditionally.
pub fn post_allocation(
    cards: &CardTable,
    object: ObjectRef,
    unaligned: bool,
    references_start: Address,
    references_end: Address,
) {
    if unaligned {
        cards.mark_range(object, references_start, references_end);
    } else {
        cards.mark_imprecise(object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card_table::{CARD_SIZE, CardState};
    use crate::types::TypeId;

    const TY: TypeId = TypeId::from_u32(3);

    fn object_at(addr: usize) -> ObjectRef {
        ObjectRef::from_address(Address::from_usize(addr)).unwrap()
    }

    #[test]
    fn test_decision_table() {
        let write = Address::from_usize(0x4000);
        let young = ObjectHeader::new(TY, false, false);
        let young_unaligned = ObjectHeader::new(TY, false, true);
        let old = ObjectHeader::new(TY, true, false);
        let large = ObjectHeader::new(TY, true, true);

        assert_eq!(store_action(young, write), BarrierAction::Skip);
        assert_eq!(store_action(young_unaligned, write), BarrierAction::Skip);
        assert_eq!(store_action(old, write), BarrierAction::Imprecise);
        assert_eq!(store_action(large, write), BarrierAction::Precise(write));

        let end = write.offset(64);
        assert_eq!(range_action(young, write, end), BarrierAction::Skip);
        assert_eq!(range_action(old, write, end), BarrierAction::Imprecise);
        assert_eq!(range_action(large, write, end), BarrierAction::Range(write, end));
        assert_eq!(range_action(large, write, write), BarrierAction::Skip);
    }

    #[test]
    fn test_young_store_marks_nothing() {
        let table = CardTable::new(Address::from_usize(0), CARD_SIZE * 4);
        let obj = object_at(8);
        post_write_inline(&table, obj, ObjectHeader::new(TY, false, false), Address::from_usize(16));
        post_write_outlined(&table, obj, ObjectHeader::new(TY, false, true), Address::from_usize(16));
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_aligned_store_marks_object_start() {
        let table = CardTable::new(Address::from_usize(0), CARD_SIZE * 4);
        // Object starts in card 0, field lies in card 1
        let obj = object_at(CARD_SIZE - 8);
        let write = Address::from_usize(CARD_SIZE + 8);
        post_write_inline(&table, obj, ObjectHeader::new(TY, true, false), write);
        assert_eq!(table.state(0), CardState::Dirty);
        assert_eq!(table.state(1), CardState::Clean);
    }

    #[test]
    fn test_unaligned_store_marks_write_card() {
        let table = CardTable::new(Address::from_usize(0), CARD_SIZE * 8);
        let obj = object_at(CARD_SIZE);
        let write = Address::from_usize(CARD_SIZE * 5 + 16);
        post_write_outlined(&table, obj, ObjectHeader::new(TY, true, true), write);
        assert_eq!(table.state(1), CardState::Clean);
        assert_eq!(table.state(5), CardState::Dirty);
        assert_eq!(table.dirty_count(), 1);
    }

    #[test]
    fn test_inline_and_outlined_agree() {
        let headers = [
            ObjectHeader::new(TY, false, false),
            ObjectHeader::new(TY, true, false),
            ObjectHeader::new(TY, true, true),
        ];
        for header in headers {
            let inline = CardTable::new(Address::from_usize(0), CARD_SIZE * 8);
            let outlined = CardTable::new(Address::from_usize(0), CARD_SIZE * 8);
            let obj = object_at(CARD_SIZE);
            let write = Address::from_usize(CARD_SIZE * 3 + 40);
            post_write_inline(&inline, obj, header, write);
            post_write_outlined(&outlined, obj, header, write);
            for index in 0..8 {
                assert_eq!(inline.state(index), outlined.state(index));
            }
        }
    }

    #[test]
    fn test_range_barrier() {
        let table = CardTable::new(Address::from_usize(0), CARD_SIZE * 8);
        let obj = object_at(8);
        post_write_range(
            &table,
            obj,
            ObjectHeader::new(TY, true, true),
            Address::from_usize(CARD_SIZE * 2),
            Address::from_usize(CARD_SIZE * 4 + 8),
        );
        assert_eq!(table.state(1), CardState::Clean);
        assert_eq!(table.state(2), CardState::Dirty);
        assert_eq!(table.state(3), CardState::Dirty);
        assert_eq!(table.state(4), CardState::Dirty);
        assert_eq!(table.state(5), CardState::Clean);
    }

    #[test]
    fn test_post_allocation_ignores_header_bits() {
        let table = CardTable::new(Address::from_usize(0), CARD_SIZE * 8);
        let obj = object_at(CARD_SIZE * 2 + 8);
        post_allocation(&table, obj, false, obj.address(), obj.address().offset(CARD_SIZE * 3));
        assert_eq!(table.dirty_count(), 1);
        assert_eq!(table.state(2), CardState::Dirty);

        table.clear();
        post_allocation(
            &table,
            obj,
            true,
            obj.address().offset(16),
            obj.address().offset(CARD_SIZE * 2),
        );
        assert_eq!(table.dirty_count(), 3);
    }
}

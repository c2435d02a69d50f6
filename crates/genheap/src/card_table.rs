//! Card table remembered set
//!
//! The heap arena is divided into 512-byte cards with one byte each. A dirty
//! card may contain a pointer into the young generation and is rescanned by
//! the next collection.
//!
//! Mutator threads dirty cards concurrently without locks: every write stores
//! the same value, so interleavings do not matter. Cards are only cleaned by
//! the collector at a safepoint.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::object::{Address, ObjectRef};

/// log2 of the card size
pub const CARD_SIZE_LOG2: u32 = 9;

/// Size of a card in bytes
pub const CARD_SIZE: usize = 1 << CARD_SIZE_LOG2;

/// Card state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// Card has no cross-generation pointers
    Clean = 0,
    /// Card may contain cross-generation pointers
    Dirty = 1,
}

/// Card table for tracking dirty cards
///
/// Covers `[base, base + size)`. Addresses outside the covered range are
/// never marked and never reported dirty.
pub struct CardTable {
    /// Base address of the covered region
    base: usize,
    /// Size of the covered region
    size: usize,
    /// Card bytes (one byte per card)
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// Create a clean card table for a heap region
    pub fn new(base: Address, size: usize) -> Self {
        let num_cards = size.div_ceil(CARD_SIZE);
        Self {
            base: base.as_usize(),
            size,
            cards: (0..num_cards)
                .map(|_| AtomicU8::new(CardState::Clean as u8))
                .collect(),
        }
    }

    /// Start of the covered region
    pub fn base(&self) -> Address {
        Address::from_usize(self.base)
    }

    /// Number of cards
    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    /// True if `addr` lies in the covered region
    #[inline(always)]
    pub fn covers(&self, addr: Address) -> bool {
        addr.as_usize().wrapping_sub(self.base) < self.size
    }

    /// Index of the card containing `addr`
    #[inline(always)]
    pub fn card_index(&self, addr: Address) -> usize {
        debug_assert!(self.covers(addr), "address {addr} outside the card table");
        addr.as_usize().wrapping_sub(self.base) >> CARD_SIZE_LOG2
    }

    /// Address range `[start, end)` of card `index`
    pub fn card_bounds(&self, index: usize) -> (Address, Address) {
        let start = self.base + (index << CARD_SIZE_LOG2);
        let end = (start + CARD_SIZE).min(self.base + self.size);
        (Address::from_usize(start), Address::from_usize(end))
    }

    #[inline(always)]
    fn dirty_index(&self, index: usize) {
        if let Some(card) = self.cards.get(index) {
            card.store(CardState::Dirty as u8, Ordering::Relaxed);
        }
    }

    /// Mark the card containing an address as dirty
    #[inline(always)]
    pub fn mark_card(&self, addr: Address) {
        if self.covers(addr) {
            self.dirty_index(self.card_index(addr));
        }
    }

    /// Dirty the card holding the object's start.
    ///
    /// Sufficient for objects in aligned chunks: the collector rescans every
    /// object that starts in a dirty card in full.
    #[inline(always)]
    pub fn mark_imprecise(&self, object: ObjectRef) {
        self.mark_card(object.address());
    }

    /// Dirty the card holding `write`, the address actually stored to
    #[inline(always)]
    pub fn mark_precise(&self, object: ObjectRef, write: Address) {
        debug_assert!(write >= object.address());
        self.mark_card(write);
    }

    /// Dirty every card intersecting `[start, end)`. Empty ranges mark nothing.
    pub fn mark_range(&self, object: ObjectRef, start: Address, end: Address) {
        debug_assert!(start >= object.address());
        if start >= end {
            return;
        }
        let lo = start.as_usize().max(self.base);
        let hi = end.as_usize().min(self.base + self.size);
        if lo >= hi {
            return;
        }
        let first = (lo - self.base) >> CARD_SIZE_LOG2;
        let last = (hi - 1 - self.base) >> CARD_SIZE_LOG2;
        for index in first..=last {
            self.dirty_index(index);
        }
    }

    /// Check if the card holding `addr` is dirty
    pub fn is_dirty(&self, addr: Address) -> bool {
        if !self.covers(addr) {
            return false;
        }
        self.cards[self.card_index(addr)].load(Ordering::Relaxed) == CardState::Dirty as u8
    }

    /// State of card `index`
    pub fn state(&self, index: usize) -> CardState {
        match self.cards[index].load(Ordering::Relaxed) {
            0 => CardState::Clean,
            _ => CardState::Dirty,
        }
    }

    /// Clean every card (collector only, at a safepoint)
    pub fn clear(&self) {
        for card in self.cards.iter() {
            card.store(CardState::Clean as u8, Ordering::Relaxed);
        }
    }

    /// Iterate over dirty cards, returning their address ranges
    pub fn dirty_cards(&self) -> impl Iterator<Item = (Address, Address)> + '_ {
        self.cards
            .iter()
            .enumerate()
            .filter(|(_, state)| state.load(Ordering::Relaxed) == CardState::Dirty as u8)
            .map(|(idx, _)| self.card_bounds(idx))
    }

    /// Number of dirty cards
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|state| state.load(Ordering::Relaxed) == CardState::Dirty as u8)
            .count()
    }
}

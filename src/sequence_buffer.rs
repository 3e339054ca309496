use crate::CanopyError;
use std::num::Wrapping;

/// Comparison helpers for wrapping u16 sequence numbers.
#[inline]
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}
#[inline]
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Fixed-capacity ring keyed by wrapping u16 sequence number. Inserting a new
/// highest sequence evicts whatever occupied its slot; sequences that have
/// fallen out of the window are rejected rather than silently aliased.
///
/// Used to retain recently sent packets for NACK-driven retransmission.
pub struct SequenceBuffer<T> {
    entries: Vec<Option<T>>,
    entry_sequences: Vec<u32>,
    sequence: u16,
}

const VACANT: u32 = 0xFFFF_FFFF;

impl<T> SequenceBuffer<T> {
    pub fn with_capacity(size: usize) -> Self {
        let mut entries = Vec::with_capacity(size);
        let mut entry_sequences = Vec::with_capacity(size);
        entries.resize_with(size, || None);
        entry_sequences.resize(size, VACANT);
        Self {
            sequence: 0,
            entries,
            entry_sequences,
        }
    }

    pub fn exists(&self, sequence: u16) -> bool {
        self.entry_sequences[self.index(sequence)] == u32::from(sequence)
    }

    pub fn get(&self, sequence: u16) -> Option<&T> {
        let index = self.index(sequence);
        if self.entry_sequences[index] != u32::from(sequence) {
            return None;
        }
        self.entries[index].as_ref()
    }

    pub fn insert(&mut self, data: T, sequence: u16) -> Result<(), CanopyError> {
        let oldest = (Wrapping(self.sequence) - Wrapping(self.capacity() as u16)).0;
        if sequence_less_than(sequence, oldest) {
            log::warn!("sequence too old to retain: {sequence}");
            return Err(CanopyError::SequenceTooOld);
        }
        if sequence_greater_than(sequence, self.sequence) {
            self.sequence = sequence;
        }
        let index = self.index(sequence);
        self.entries[index] = Some(data);
        self.entry_sequences[index] = u32::from(sequence);
        Ok(())
    }

    pub fn remove(&mut self, sequence: u16) -> Option<T> {
        let index = self.index(sequence);
        if self.entry_sequences[index] != u32::from(sequence) {
            return None;
        }
        self.entry_sequences[index] = VACANT;
        self.entries[index].take()
    }

    /// Newest sequence number ever inserted.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    fn index(&self, sequence: u16) -> usize {
        (sequence % self.entries.len() as u16) as usize
    }
}

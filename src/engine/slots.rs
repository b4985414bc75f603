//! Buffer slot arena
//!
//! Slots are addressed by a stable index plus a generation, so a handle held
//! by the output device goes stale once its slot is recycled or the arena is
//! cleared.

use crate::error::EngineError;

/// Stable handle to a buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

/// Slot lifecycle: `Free → Filled → Enqueued → Playing → Drained`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Filled,
    Enqueued,
    Playing,
    Drained,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: SlotState,
    data: Vec<u8>,
}

/// Fixed-capacity pool of output buffers
#[derive(Debug)]
pub struct SlotArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    max_slots: usize,
    capacity: usize,
}

impl SlotArena {
    /// Create an arena of at most `max_slots` buffers of `capacity` bytes
    #[must_use]
    pub const fn new(max_slots: usize, capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            max_slots,
            capacity,
        }
    }

    /// Copy `chunk` into a free slot (`Free → Filled`)
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AllocationFailed`] if the chunk exceeds the slot
    /// capacity or every slot is in use
    pub fn allocate(&mut self, chunk: &[u8]) -> Result<SlotId, EngineError> {
        if chunk.len() > self.capacity {
            return Err(EngineError::AllocationFailed(format!(
                "chunk of {} bytes exceeds slot capacity {}",
                chunk.len(),
                self.capacity
            )));
        }

        let index = if let Some(index) = self.free.pop() {
            index
        } else if self.slots.len() < self.max_slots {
            let index = u32::try_from(self.slots.len())
                .map_err(|_| EngineError::AllocationFailed("slot index overflow".to_string()))?;
            self.slots.push(Slot {
                generation: 0,
                state: SlotState::Free,
                data: Vec::with_capacity(self.capacity),
            });
            index
        } else {
            return Err(EngineError::AllocationFailed(format!(
                "all {} slots in use",
                self.max_slots
            )));
        };

        let slot = &mut self.slots[index as usize];
        slot.data.clear();
        slot.data.extend_from_slice(chunk);
        slot.state = SlotState::Filled;

        Ok(SlotId {
            index,
            generation: slot.generation,
        })
    }

    /// `Filled → Enqueued`
    pub fn mark_enqueued(&mut self, id: SlotId) -> bool {
        self.transition(id, SlotState::Filled, SlotState::Enqueued)
    }

    /// `Enqueued → Playing`
    pub fn mark_playing(&mut self, id: SlotId) -> bool {
        self.transition(id, SlotState::Enqueued, SlotState::Playing)
    }

    /// `Enqueued | Playing → Drained`, then recycle the slot
    ///
    /// Returns `false` for stale or unknown handles, which must not count as
    /// a completion.
    pub fn complete(&mut self, id: SlotId) -> bool {
        let Some(slot) = self.slot_mut(id) else {
            return false;
        };
        if !matches!(slot.state, SlotState::Enqueued | SlotState::Playing) {
            return false;
        }
        slot.state = SlotState::Drained;
        self.recycle(id.index);
        true
    }

    /// Return a slot that never reached the device
    pub fn release(&mut self, id: SlotId) {
        if self.slot_mut(id).is_some() {
            self.recycle(id.index);
        }
    }

    /// Bytes held by a live slot
    #[must_use]
    pub fn data(&self, id: SlotId) -> Option<&[u8]> {
        self.slot(id).map(|slot| slot.data.as_slice())
    }

    /// Current state of a live slot; `None` once the handle is stale
    #[must_use]
    pub fn state(&self, id: SlotId) -> Option<SlotState> {
        self.slot(id).map(|slot| slot.state)
    }

    /// Recycle every slot, invalidating all outstanding handles
    pub fn clear(&mut self) {
        for index in 0..self.slots.len() {
            if self.slots[index].state != SlotState::Free {
                #[allow(clippy::cast_possible_truncation)]
                self.recycle(index as u32);
            }
        }
    }

    /// Slots not currently free
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn transition(&mut self, id: SlotId, from: SlotState, to: SlotState) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.state == from => {
                slot.state = to;
                true
            }
            _ => false,
        }
    }

    fn recycle(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Free;
        slot.data.clear();
        self.free.push(index);
    }

    fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.state != SlotState::Free)
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.state != SlotState::Free)
    }
}

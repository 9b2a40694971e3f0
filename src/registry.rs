//! Event registry: tag -> event descriptor.
//!
//! Tags are allocated monotonically, so registration order is also tag
//! order; `order` keeps it explicit for `all_tags()`.

use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::event::{APPLY_TO_ALL_TAG, ActionSet, CallingStage, Event, EventInfo, EventKind, TAG_START_SEED, Tag};
use crate::status::Error;

/// Owner of every event descriptor.
pub struct EventRegistry {
    events: HashMap<Tag, Event>,
    order: Vec<Tag>,
    next_tag: Tag,
    free_slots: Vec<usize>,
    next_slot: usize,
    capacity: usize,
}

impl EventRegistry {
    /// Create an empty registry holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: HashMap::new(),
            order: Vec::new(),
            next_tag: TAG_START_SEED,
            free_slots: Vec::new(),
            next_slot: 0,
            capacity,
        }
    }

    fn allocate_tag(&mut self) -> Result<Tag, Error> {
        let tag = self.next_tag;
        if tag == APPLY_TO_ALL_TAG {
            return Err(Error::RegistryFull);
        }
        self.next_tag += 1;
        Ok(tag)
    }

    /// Register a new, disabled event.
    pub fn register(
        &mut self,
        kind: EventKind,
        actions: ActionSet,
        stage: CallingStage,
    ) -> Result<Tag, Error> {
        if self.events.len() >= self.capacity {
            return Err(Error::RegistryFull);
        }

        let tag = self.allocate_tag()?;
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.next_slot += 1;
                self.next_slot - 1
            }
        };
        self.events
            .insert(tag, Event::new(tag, slot, kind, actions, stage));
        self.order.push(tag);
        log::info!("event: registered {:#x} kind={} stage={:?}", tag, kind.label(), stage);
        Ok(tag)
    }

    /// Register an event from a wire kind code.
    pub fn register_raw(
        &mut self,
        code: u32,
        actions: ActionSet,
        stage: CallingStage,
    ) -> Result<Tag, Error> {
        let kind = EventKind::try_from(code)?;
        self.register(kind, actions, stage)
    }

    pub fn lookup(&self, tag: Tag) -> Result<&Event, Error> {
        self.events.get(&tag).ok_or(Error::InvalidEventTag(tag))
    }

    pub fn lookup_mut(&mut self, tag: Tag) -> Result<&mut Event, Error> {
        self.events.get_mut(&tag).ok_or(Error::InvalidEventTag(tag))
    }

    /// Delete an event.
    ///
    /// `still_held` reports whether any core still has the event applied; the
    /// descriptor is only dropped once its resources were released.
    pub fn remove(&mut self, tag: Tag, still_held: bool) -> Result<Event, Error> {
        if !self.events.contains_key(&tag) {
            return Err(Error::InvalidEventTag(tag));
        }
        if still_held {
            return Err(Error::EventStillActive(tag));
        }

        self.order.retain(|t| *t != tag);
        let event = self.events.remove(&tag).ok_or(Error::InvalidEventTag(tag))?;
        self.free_slots.push(event.slot);
        log::info!("event: removed {:#x}", tag);
        Ok(event)
    }

    /// Every registered tag, in registration order.
    pub fn all_tags(&self) -> Vec<Tag> {
        self.order.clone()
    }

    /// Iterate events in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> + '_ {
        self.order.iter().filter_map(|tag| self.events.get(tag))
    }

    pub fn list(&self) -> Vec<EventInfo> {
        self.iter().map(Event::info).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

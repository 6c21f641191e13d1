//! # Event Table
//!
//! A bounded ring of in-flight completion events. Every enqueue made through a
//! [`crate::DeviceContext`] registers its native event here and hands the
//! caller a small integer [`EventId`] instead of the native handle.
//!
//! ## Slots and ids
//!
//! The table has a fixed number of slots. New events take slots in ring
//! order, skipping slots the caller has retained; the unretained occupant of
//! the chosen slot is evicted and its native handle released. An id encodes
//! both the slot and how many times that slot has been reused:
//!
//! ```text
//! id = generation * capacity + slot
//! ```
//!
//! so an id whose slot has since been recycled is detected as stale instead
//! of silently resolving to someone else's event.

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::driver::{EventProfile, EventStatus, NativeEvent};
use crate::queue::CommandQueue;

/// Client-visible event handle.
pub type EventId = i32;

/// Returned whenever no event could be produced.
pub const NO_EVENT: EventId = -1;

/// Element type moved by a transfer, used to label events.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PrimitiveKind {
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Half,
}

impl PrimitiveKind {
    pub fn array_name(self) -> &'static str {
        match self {
            PrimitiveKind::Byte => "byte[]",
            PrimitiveKind::Char => "char[]",
            PrimitiveKind::Short => "short[]",
            PrimitiveKind::Int => "int[]",
            PrimitiveKind::Long => "long[]",
            PrimitiveKind::Float => "float[]",
            PrimitiveKind::Double => "double[]",
            PrimitiveKind::Half => "half[]",
        }
    }
}

/// Host element types that may be transferred to and from the heap.
pub trait HostPrimitive: bytemuck::Pod {
    const KIND: PrimitiveKind;
}

macro_rules! host_primitive {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl HostPrimitive for $ty {
            const KIND: PrimitiveKind = PrimitiveKind::$kind;
        })*
    };
}

host_primitive! {
    u8 => Byte,
    i8 => Byte,
    u16 => Char,
    i16 => Short,
    i32 => Int,
    u32 => Int,
    i64 => Long,
    u64 => Long,
    f32 => Float,
    f64 => Double,
    half::f16 => Half,
}

/// What kind of command produced an event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EventDescription {
    SerialKernel,
    ParallelKernel,
    Write(PrimitiveKind),
    Read(PrimitiveKind),
    SyncBarrier,
    SyncMarker,
}

impl EventDescription {
    pub fn is_kernel(self) -> bool {
        matches!(
            self,
            EventDescription::SerialKernel | EventDescription::ParallelKernel
        )
    }
}

impl fmt::Display for EventDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventDescription::SerialKernel => write!(f, "kernel - serial"),
            EventDescription::ParallelKernel => write!(f, "kernel - parallel"),
            EventDescription::Write(kind) => write!(f, "writeToDevice - {}", kind.array_name()),
            EventDescription::Read(kind) => write!(f, "readFromDevice - {}", kind.array_name()),
            EventDescription::SyncBarrier => write!(f, "sync - barrier"),
            EventDescription::SyncMarker => write!(f, "sync - marker"),
        }
    }
}

/// One registered event.
#[derive(Clone, Debug)]
pub struct EventRecord {
    pub id: EventId,
    pub native: NativeEvent,
    pub description: EventDescription,
    /// Context value: the kernel handle for launches, the device offset for
    /// transfers.
    pub tag: u64,
    pub created_at: Instant,
}

/// A live event together with its device timestamps and status.
#[derive(Clone, Debug, Serialize)]
pub struct EventSnapshot {
    pub id: EventId,
    #[serde(serialize_with = "serialize_native")]
    pub native: NativeEvent,
    pub name: String,
    pub description: EventDescription,
    pub tag: u64,
    pub profile: EventProfile,
    pub status: EventStatus,
}

fn serialize_native<S: serde::Serializer>(event: &NativeEvent, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(event.raw())
}

#[derive(Default)]
struct Slot {
    record: Option<EventRecord>,
    retained: bool,
    next_generation: i32,
}

/// Bounded table of in-flight events.
pub struct EventTable {
    slots: Vec<Slot>,
    cursor: usize,
    generations: i32,
    wait_buffer: Vec<NativeEvent>,
}

impl EventTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let generations = ((i32::MAX as i64 + 1) / capacity as i64).clamp(1, i32::MAX as i64) as i32;
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            cursor: 0,
            generations,
            wait_buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.record.is_none())
    }

    fn slot_of(&self, id: EventId) -> Option<usize> {
        if id < 0 {
            return None;
        }
        let slot = id as usize % self.slots.len();
        match &self.slots[slot].record {
            Some(record) if record.id == id => Some(slot),
            _ => None,
        }
    }

    /// Stores `native` and returns its id, or [`NO_EVENT`] when `native` is
    /// the none handle or every slot is retained.
    pub fn register_event(
        &mut self,
        native: NativeEvent,
        description: EventDescription,
        tag: u64,
        queue: &CommandQueue,
    ) -> EventId {
        if native.is_none() {
            return NO_EVENT;
        }

        let capacity = self.slots.len();
        let free = (0..capacity)
            .map(|i| (self.cursor + i) % capacity)
            .find(|&slot| !self.slots[slot].retained);

        let slot = match free {
            Some(slot) => slot,
            None => {
                queue.release_event(native);
                tracing::error!(
                    "event table full: all {} events are retained, dropping {}",
                    capacity,
                    description
                );
                return NO_EVENT;
            }
        };

        let generations = self.generations;
        let entry = &mut self.slots[slot];
        if let Some(evicted) = entry.record.take() {
            tracing::trace!("evicting event {} ({})", evicted.id, evicted.description);
            queue.release_event(evicted.native);
        }

        let generation = entry.next_generation;
        entry.next_generation = (generation + 1) % generations;
        let id = generation * capacity as i32 + slot as i32;
        entry.record = Some(EventRecord {
            id,
            native,
            description,
            tag,
            created_at: Instant::now(),
        });

        self.cursor = (slot + 1) % capacity;
        id
    }

    /// Collects the native handles of `ids` into the wait buffer, skipping
    /// [`NO_EVENT`]. Returns `false` when nothing remains.
    ///
    /// Waiting on an evicted or unknown id is a caller bug: it asserts in
    /// debug builds and the id is dropped from the list in release builds.
    pub fn serialise_events(&mut self, ids: &[EventId]) -> bool {
        self.wait_buffer.clear();
        for &id in ids {
            if id == NO_EVENT {
                continue;
            }
            match self.slot_of(id) {
                Some(slot) => {
                    if let Some(record) = &self.slots[slot].record {
                        self.wait_buffer.push(record.native);
                    }
                }
                None => {
                    debug_assert!(false, "stale or unknown event {} in wait list", id);
                    tracing::warn!("ignoring stale event {} in wait list", id);
                }
            }
        }
        !self.wait_buffer.is_empty()
    }

    /// Native handles gathered by the last [`serialise_events`](Self::serialise_events).
    pub fn wait_events(&self) -> &[NativeEvent] {
        &self.wait_buffer
    }

    /// Pins `id` so it is never evicted. Returns `false` for unknown ids.
    pub fn retain_event(&mut self, id: EventId) -> bool {
        match self.slot_of(id) {
            Some(slot) => {
                self.slots[slot].retained = true;
                true
            }
            None => {
                tracing::warn!("cannot retain unknown event {}", id);
                false
            }
        }
    }

    pub fn is_retained(&self, id: EventId) -> bool {
        self.slot_of(id).is_some_and(|slot| self.slots[slot].retained)
    }

    /// Releases `id` now and frees its slot.
    pub fn release_event(&mut self, id: EventId, queue: &CommandQueue) {
        match self.slot_of(id) {
            Some(slot) => {
                let entry = &mut self.slots[slot];
                entry.retained = false;
                if let Some(record) = entry.record.take() {
                    queue.release_event(record.native);
                }
            }
            None if id == NO_EVENT => {}
            None => tracing::warn!("cannot release unknown event {}", id),
        }
    }

    pub fn record(&self, id: EventId) -> Option<&EventRecord> {
        self.slot_of(id)
            .and_then(|slot| self.slots[slot].record.as_ref())
    }

    /// Live event for `id`, `None` for [`NO_EVENT`] or stale ids.
    pub fn try_resolve(&self, id: EventId, queue: &CommandQueue) -> Option<Event> {
        self.record(id).map(|record| Event::new(record, queue.clone()))
    }

    /// Event handle for `id`. [`NO_EVENT`] yields the empty event; a stale or
    /// out-of-range id is a caller bug and asserts in debug builds.
    pub fn resolve(&self, id: EventId, queue: &CommandQueue) -> Event {
        if id == NO_EVENT {
            return Event::empty();
        }
        match self.try_resolve(id, queue) {
            Some(event) => event,
            None => {
                debug_assert!(false, "resolved stale or unknown event id {}", id);
                tracing::error!("resolved stale or unknown event id {}", id);
                Event::empty()
            }
        }
    }

    /// Live events with profiling data, ordered by submit time, then start
    /// time, then id.
    pub fn events(&self, queue: &CommandQueue) -> Vec<EventSnapshot> {
        let mut snapshots: Vec<EventSnapshot> = self
            .slots
            .iter()
            .filter_map(|s| s.record.as_ref())
            .map(|record| EventSnapshot {
                id: record.id,
                native: record.native,
                name: record.description.to_string(),
                description: record.description,
                tag: record.tag,
                profile: queue.event_profile(record.native),
                status: queue.event_status(record.native),
            })
            .collect();
        snapshots.sort_by_key(|s| (s.profile.submitted, s.profile.started, s.id));
        snapshots
    }

    /// Releases every native handle and clears all retain flags. Slot
    /// generations survive, so ids issued before the reset stay stale.
    pub fn reset(&mut self, queue: &CommandQueue) {
        for slot in &mut self.slots {
            slot.retained = false;
            if let Some(record) = slot.record.take() {
                queue.release_event(record.native);
            }
        }
        self.cursor = 0;
        self.wait_buffer.clear();
    }
}

#[derive(Clone, Debug)]
struct EventInner {
    id: EventId,
    native: NativeEvent,
    description: EventDescription,
    tag: u64,
    queue: CommandQueue,
}

/// Handle to one registered event. Valid until its id is evicted, released
/// or the table is reset.
#[derive(Clone, Debug, Default)]
pub struct Event {
    inner: Option<EventInner>,
}

impl Event {
    fn new(record: &EventRecord, queue: CommandQueue) -> Self {
        Self {
            inner: Some(EventInner {
                id: record.id,
                native: record.native,
                description: record.description,
                tag: record.tag,
                queue,
            }),
        }
    }

    /// The no-op event: waits return at once and the status is complete.
    pub fn empty() -> Self {
        Self { inner: None }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    pub fn id(&self) -> EventId {
        self.inner.as_ref().map_or(NO_EVENT, |i| i.id)
    }

    pub fn name(&self) -> String {
        self.inner
            .as_ref()
            .map_or_else(|| "none".to_string(), |i| i.description.to_string())
    }

    pub fn description(&self) -> Option<EventDescription> {
        self.inner.as_ref().map(|i| i.description)
    }

    pub fn tag(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| i.tag)
    }

    pub fn native(&self) -> NativeEvent {
        self.inner.as_ref().map_or(NativeEvent::NONE, |i| i.native)
    }

    /// Blocks until the command behind this event has finished.
    pub fn wait(&self) {
        if let Some(inner) = &self.inner {
            inner.queue.wait_events(&[inner.native]);
        }
    }

    pub fn status(&self) -> EventStatus {
        match &self.inner {
            Some(inner) => inner.queue.event_status(inner.native),
            None => EventStatus::Complete,
        }
    }

    pub fn profile(&self) -> EventProfile {
        match &self.inner {
            Some(inner) => inner.queue.event_profile(inner.native),
            None => EventProfile::default(),
        }
    }

    /// Device execution time in nanoseconds.
    pub fn elapsed_ns(&self) -> u64 {
        self.profile().duration_ns()
    }
}

//! Slot pool: a fixed set of preallocated, aligned layer buffers.
//!
//! Buffers are allocated once at startup and reused for the whole run. A
//! buffer is handed out by value ([`SlotPool::take_buffer`]) to whichever
//! task currently owns the slot (a load or the consumer) and handed back
//! with [`SlotPool::restore_buffer`], so only one party can touch the bytes
//! at a time.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{PipelineError, Result};
use crate::index::LayerId;

/// A heap buffer of fixed length with a guaranteed start alignment.
///
/// Zero-initialised on allocation and freed on drop.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation; shared access only
// hands out `&[u8]`, mutation requires `&mut self`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes aligned to `align`.
    ///
    /// Returns `None` if the layout is invalid or the allocator fails.
    pub fn zeroed(len: usize, align: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, align).ok()?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(raw).map(|ptr| Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }
}

impl std::ops::Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl std::ops::DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in `zeroed`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len())
            .field("align", &self.align())
            .finish()
    }
}

/// Lifecycle of a slot. Transitions are driven only by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Holds its buffer, bound to no layer.
    Empty,
    /// Buffer is inside a load task.
    Loading,
    /// Buffer holds a fully loaded layer.
    Ready,
    /// Buffer is inside the consumer.
    Consuming,
}

/// One pool entry.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    state: SlotState,
    bound_layer: Option<LayerId>,
    buffer: Option<AlignedBuffer>,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn bound_layer(&self) -> Option<LayerId> {
        self.bound_layer
    }

    /// Bytes of the resident layer; only available while `Ready`.
    pub fn data(&self) -> Option<&[u8]> {
        match self.state {
            SlotState::Ready => self.buffer.as_deref(),
            _ => None,
        }
    }
}

/// Fixed set of `window` reusable layer buffers, addressed by index.
pub struct SlotPool {
    slots: Vec<Slot>,
    buffer_bytes: usize,
    align: usize,
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("slots", &self.slots.len())
            .field("buffer_bytes", &self.buffer_bytes)
            .field("align", &self.align)
            .field("states", &self.states())
            .finish()
    }
}

impl SlotPool {
    /// Allocate `window` buffers of exactly `buffer_bytes`, aligned to `align`.
    ///
    /// On failure every buffer allocated so far is released before returning.
    pub fn allocate(window: usize, buffer_bytes: usize, align: usize) -> Result<Self> {
        Self::allocate_with(window, buffer_bytes, align, |_| AlignedBuffer::zeroed(buffer_bytes, align))
    }

    /// `allocate` with the per-slot allocation supplied by the caller.
    pub(crate) fn allocate_with(
        window: usize,
        buffer_bytes: usize,
        align: usize,
        mut alloc: impl FnMut(usize) -> Option<AlignedBuffer>,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(window);
        for index in 0..window {
            // On failure `slots` is dropped here, freeing buffers 0..index.
            let buffer = alloc(index).ok_or(PipelineError::OutOfMemory {
                slot: index,
                bytes: buffer_bytes,
                align,
            })?;
            slots.push(Slot {
                index,
                state: SlotState::Empty,
                bound_layer: None,
                buffer: Some(buffer),
            });
        }

        tracing::debug!(
            "SlotPool: {} slots x {:.1} MB (align {})",
            window,
            buffer_bytes as f64 / (1024.0 * 1024.0),
            align,
        );

        Ok(Self { slots, buffer_bytes, align })
    }

    /// Free every buffer. Dropping the pool has the same effect.
    pub fn release(self) {
        tracing::trace!("SlotPool: releasing {} buffers", self.slots.len());
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Number of buffers this pool ever allocated (fixed at construction).
    pub fn buffers_allocated(&self) -> usize {
        self.slots.len()
    }

    /// Total bytes owned by the pool.
    pub fn memory_bytes(&self) -> usize {
        self.slots.len() * self.buffer_bytes
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn states(&self) -> Vec<SlotState> {
        self.slots.iter().map(|s| s.state).collect()
    }

    /// Whether every slot is back in `Empty` with its buffer present.
    pub fn is_idle(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.state == SlotState::Empty && s.buffer.is_some() && s.bound_layer.is_none())
    }

    /// Move a slot's buffer out, transitioning `from → to`.
    ///
    /// Used for `Empty → Loading` (bind `layer`) and `Ready → Consuming`.
    pub(crate) fn take_buffer(
        &mut self,
        index: usize,
        from: SlotState,
        to: SlotState,
        layer: LayerId,
    ) -> Result<AlignedBuffer> {
        let slot = self.slot_mut(index)?;
        if slot.state != from {
            return Err(PipelineError::SchedulerInvariantViolation(format!(
                "slot {index} expected {from:?} for layer {layer}, found {:?}",
                slot.state
            )));
        }
        if from == SlotState::Ready && slot.bound_layer != Some(layer) {
            return Err(PipelineError::SchedulerInvariantViolation(format!(
                "slot {index} holds layer {:?}, expected {layer}",
                slot.bound_layer
            )));
        }
        let buffer = slot.buffer.take().ok_or_else(|| {
            PipelineError::SchedulerInvariantViolation(format!(
                "slot {index} in {from:?} has no buffer"
            ))
        })?;
        slot.state = to;
        slot.bound_layer = Some(layer);
        Ok(buffer)
    }

    /// Return a buffer to its slot.
    ///
    /// `Loading → Ready` keeps the binding; `Consuming → Empty` clears it.
    /// A failed load passes `Empty` as the target so the bytes are never
    /// exposed as `Ready`.
    pub(crate) fn restore_buffer(
        &mut self,
        index: usize,
        buffer: AlignedBuffer,
        to: SlotState,
    ) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.buffer.is_some() {
            return Err(PipelineError::SchedulerInvariantViolation(format!(
                "slot {index} already holds a buffer"
            )));
        }
        slot.buffer = Some(buffer);
        slot.state = to;
        if to == SlotState::Empty {
            slot.bound_layer = None;
        }
        Ok(())
    }

    /// Return every slot that still holds its buffer to `Empty`.
    ///
    /// Used after an aborted run once all tasks have been joined.
    pub(crate) fn reset(&mut self) {
        for slot in self.slots.iter_mut().filter(|s| s.buffer.is_some()) {
            slot.state = SlotState::Empty;
            slot.bound_layer = None;
        }
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot> {
        let len = self.slots.len();
        self.slots.get_mut(index).ok_or_else(|| {
            PipelineError::SchedulerInvariantViolation(format!(
                "slot index {index} out of range (pool size {len})"
            ))
        })
    }
}

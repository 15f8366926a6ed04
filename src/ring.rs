//! Ring of driver buffers mapped into the process.

use tracing::{debug, error, warn};

use crate::traits::{CameraError, MappedMemory, Result, VideoDevice};

/// One mapped driver buffer.
#[derive(Debug)]
pub struct BufferSlot<M> {
    index: u32,
    memory: M,
}

impl<M: MappedMemory> BufferSlot<M> {
    /// Driver buffer index.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Shared memory backing this slot.
    pub const fn memory(&self) -> &M {
        &self.memory
    }
}

/// The set of buffers currently granted by the driver.
///
/// Buffers are acquired all-or-nothing by [`BufferRing::allocate`] and handed
/// back by [`BufferRing::release`], which runs on failure paths as well as on
/// normal shutdown.
#[derive(Debug)]
pub struct BufferRing<M> {
    slots: Vec<BufferSlot<M>>,
    // Buffers the driver currently holds for us, mapped or not.
    granted: u32,
}

impl<M> Default for BufferRing<M> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            granted: 0,
        }
    }
}

impl<M: MappedMemory> BufferRing<M> {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mapped buffers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no buffer is mapped.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot with driver index `index`.
    pub fn get(&self, index: u32) -> Option<&BufferSlot<M>> {
        self.slots.get(index as usize).filter(|slot| slot.index == index)
    }

    /// Request `count` buffers and map every one the driver grants.
    ///
    /// Returns the granted count, which may be lower than `count`. On any failure
    /// the buffers acquired so far are released before the error is returned.
    pub fn allocate<D>(&mut self, device: &mut D, count: u32) -> Result<u32>
    where
        D: VideoDevice<Mapping = M>,
    {
        if !self.is_empty() || self.granted > 0 {
            self.release(device);
        }

        match self.map_all(device, count) {
            Ok(granted) => Ok(granted),
            Err(err) => {
                self.release(device);
                Err(err)
            }
        }
    }

    fn map_all<D>(&mut self, device: &mut D, count: u32) -> Result<u32>
    where
        D: VideoDevice<Mapping = M>,
    {
        let granted = device.request_buffers(count)?;
        self.granted = granted;

        if granted == 0 {
            return Err(CameraError::NoBuffersAllocated);
        }
        if granted != count {
            warn!(requested = count, granted, "driver changed buffer count");
        }

        self.slots.reserve(granted as usize);
        for index in 0..granted {
            let info = device.query_buffer(index)?;
            let memory = device.map_buffer(&info)?;
            debug!(index, length = info.length, "buffer ready");
            self.slots.push(BufferSlot { index, memory });
        }

        Ok(granted)
    }

    /// Hand every slot to the driver's incoming queue.
    pub fn enqueue_all<D>(&self, device: &mut D) -> Result<()>
    where
        D: VideoDevice<Mapping = M>,
    {
        self.slots
            .iter()
            .try_for_each(|slot| device.enqueue(slot.index))
    }

    /// Unmap every slot, then ask the driver to free its buffers.
    ///
    /// Errors are logged, not returned; the ring is empty afterwards either way.
    /// Returns `true` when every step succeeded.
    pub fn release<D>(&mut self, device: &mut D) -> bool
    where
        D: VideoDevice<Mapping = M>,
    {
        let mut clean = true;

        for slot in self.slots.drain(..) {
            if let Err(err) = device.unmap_buffer(slot.index, slot.memory) {
                error!(error = %err, "cannot unmap buffer");
                clean = false;
            }
        }

        if self.granted > 0 {
            self.granted = 0;
            if let Err(err) = device.request_buffers(0) {
                error!(error = %err, "cannot release driver buffers");
                clean = false;
            }
        }

        clean
    }
}

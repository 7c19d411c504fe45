//! Memory brokers and scoped buffer ownership.
//!
//! Containers, native images and buffered strips cross the entry point as
//! opaque [`MemHandle`]s. Whoever reads or writes a block must lock it
//! first and unlock it afterwards; a block may only be freed once every
//! lock has been released.
//!
//! Two tables exist. [`LegacyMemory`] models the OS-global allocator older
//! sources use: locks nest, so a block locked twice must be unlocked twice
//! before it can be freed. [`NegotiatedMemory`] models the table a 2.x
//! broker hands out through entry-point negotiation: a lock is a flag, not
//! a counter. A [`Source`](crate::source::Source) picks one when it opens
//! and keeps it for the rest of its life.
//!
//! Application code never calls `free` directly. [`ScopedBuffer`] owns a
//! handle and releases it (unlock to zero, then free) exactly once, on
//! every exit path.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use scanbridge_proto::{CapValue, ItemType, payloads::MemHandle};

use crate::error::{CapabilityError, MemoryError};

/// Which allocation table a broker implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// OS-global allocator, nested lock counts
    Legacy,
    /// Table obtained through entry-point negotiation
    Negotiated,
}

/// Counters kept by every broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    /// Successful allocations
    pub allocations: u64,
    /// Successful frees
    pub frees: u64,
    /// Successful locks
    pub locks: u64,
    /// Successful unlocks
    pub unlocks: u64,
    /// Frees refused because the block was still locked
    pub rejected_frees: u64,
}

impl MemoryStats {
    /// Blocks allocated and not yet freed.
    pub fn live(&self) -> u64 {
        self.allocations - self.frees
    }
}

/// Allocate/lock/unlock/free table shared by application and driver.
pub trait MemoryBroker: Send + Sync + fmt::Debug {
    /// Table this broker implements.
    fn kind(&self) -> MemoryKind;

    /// Allocate a zeroed block.
    fn allocate(&self, size: usize) -> Result<MemHandle, MemoryError>;

    /// Lock a block for access. Returns the lock count afterwards.
    fn lock(&self, handle: MemHandle) -> Result<u32, MemoryError>;

    /// Release one lock. Returns the lock count afterwards.
    fn unlock(&self, handle: MemHandle) -> Result<u32, MemoryError>;

    /// Free an unlocked block.
    fn free(&self, handle: MemHandle) -> Result<(), MemoryError>;

    /// Current lock count of a block.
    fn lock_count(&self, handle: MemHandle) -> Result<u32, MemoryError>;

    /// Size of a block.
    fn size(&self, handle: MemHandle) -> Result<usize, MemoryError>;

    /// Copy bytes out of a locked block.
    fn read(&self, handle: MemHandle, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError>;

    /// Copy bytes into a locked block.
    fn write(&self, handle: MemHandle, offset: usize, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Whether the handle belongs to this broker and is still allocated.
    fn contains(&self, handle: MemHandle) -> bool;

    /// Counters since creation.
    fn stats(&self) -> MemoryStats;
}

/// Largest block either table hands out.
const MAX_BLOCK: usize = 256 * 1024 * 1024;

#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    locks: u32,
}

#[derive(Debug, Default)]
struct TableInner {
    next: u64,
    blocks: HashMap<u64, Block>,
    stats: MemoryStats,
}

/// Block table behind both brokers. `nested` selects counted locks.
#[derive(Debug)]
struct BlockTable {
    nested: bool,
    base: u64,
    inner: Mutex<TableInner>,
}

impl BlockTable {
    fn new(nested: bool, base: u64) -> Self {
        Self { nested, base, inner: Mutex::new(TableInner::default()) }
    }

    fn inner(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self, size: usize) -> Result<MemHandle, MemoryError> {
        if size > MAX_BLOCK {
            return Err(MemoryError::AllocationFailed(size));
        }
        let mut inner = self.inner();
        inner.next += 1;
        let raw = self.base + inner.next;
        inner.blocks.insert(raw, Block { data: vec![0; size], locks: 0 });
        inner.stats.allocations += 1;
        Ok(MemHandle(raw))
    }

    fn lock(&self, handle: MemHandle) -> Result<u32, MemoryError> {
        let mut inner = self.inner();
        let block = inner.blocks.get_mut(&handle.0).ok_or(MemoryError::UnknownHandle(handle))?;
        block.locks = if self.nested { block.locks + 1 } else { 1 };
        let locks = block.locks;
        inner.stats.locks += 1;
        Ok(locks)
    }

    fn unlock(&self, handle: MemHandle) -> Result<u32, MemoryError> {
        let mut inner = self.inner();
        let block = inner.blocks.get_mut(&handle.0).ok_or(MemoryError::UnknownHandle(handle))?;
        if block.locks == 0 {
            return Err(MemoryError::NotLocked(handle));
        }
        block.locks -= 1;
        let locks = block.locks;
        inner.stats.unlocks += 1;
        Ok(locks)
    }

    fn free(&self, handle: MemHandle) -> Result<(), MemoryError> {
        let mut inner = self.inner();
        let locks = inner.blocks.get(&handle.0).ok_or(MemoryError::UnknownHandle(handle))?.locks;
        if locks > 0 {
            inner.stats.rejected_frees += 1;
            return Err(MemoryError::FreeWhileLocked { handle, locks });
        }
        inner.blocks.remove(&handle.0);
        inner.stats.frees += 1;
        Ok(())
    }

    fn with_block<T>(
        &self,
        handle: MemHandle,
        f: impl FnOnce(&mut Block) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let mut inner = self.inner();
        let block = inner.blocks.get_mut(&handle.0).ok_or(MemoryError::UnknownHandle(handle))?;
        f(block)
    }

    fn locked_range(
        handle: MemHandle,
        block: &Block,
        offset: usize,
        len: usize,
    ) -> Result<std::ops::Range<usize>, MemoryError> {
        if block.locks == 0 {
            return Err(MemoryError::NotLocked(handle));
        }
        let size = block.data.len();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset..end),
            _ => Err(MemoryError::OutOfBounds { handle, offset, len, size }),
        }
    }

    fn read(&self, handle: MemHandle, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.with_block(handle, |block| {
            let range = Self::locked_range(handle, block, offset, len)?;
            Ok(block.data[range].to_vec())
        })
    }

    fn write(&self, handle: MemHandle, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        self.with_block(handle, |block| {
            let range = Self::locked_range(handle, block, offset, bytes.len())?;
            block.data[range].copy_from_slice(bytes);
            Ok(())
        })
    }
}

macro_rules! delegate_broker {
    ($ty:ty, $kind:expr) => {
        impl MemoryBroker for $ty {
            fn kind(&self) -> MemoryKind {
                $kind
            }

            fn allocate(&self, size: usize) -> Result<MemHandle, MemoryError> {
                self.table.allocate(size)
            }

            fn lock(&self, handle: MemHandle) -> Result<u32, MemoryError> {
                self.table.lock(handle)
            }

            fn unlock(&self, handle: MemHandle) -> Result<u32, MemoryError> {
                self.table.unlock(handle)
            }

            fn free(&self, handle: MemHandle) -> Result<(), MemoryError> {
                self.table.free(handle)
            }

            fn lock_count(&self, handle: MemHandle) -> Result<u32, MemoryError> {
                self.table.with_block(handle, |block| Ok(block.locks))
            }

            fn size(&self, handle: MemHandle) -> Result<usize, MemoryError> {
                self.table.with_block(handle, |block| Ok(block.data.len()))
            }

            fn read(
                &self,
                handle: MemHandle,
                offset: usize,
                len: usize,
            ) -> Result<Vec<u8>, MemoryError> {
                self.table.read(handle, offset, len)
            }

            fn write(
                &self,
                handle: MemHandle,
                offset: usize,
                bytes: &[u8],
            ) -> Result<(), MemoryError> {
                self.table.write(handle, offset, bytes)
            }

            fn contains(&self, handle: MemHandle) -> bool {
                self.table.inner().blocks.contains_key(&handle.0)
            }

            fn stats(&self) -> MemoryStats {
                self.table.inner().stats
            }
        }
    };
}

/// OS-global allocation table with nested lock counts.
#[derive(Debug)]
pub struct LegacyMemory {
    table: BlockTable,
}

impl LegacyMemory {
    /// Empty table.
    pub fn new() -> Self {
        Self { table: BlockTable::new(true, 0x0001_0000) }
    }
}

impl Default for LegacyMemory {
    fn default() -> Self {
        Self::new()
    }
}

delegate_broker!(LegacyMemory, MemoryKind::Legacy);

/// Allocation table handed out by a 2.x broker.
#[derive(Debug)]
pub struct NegotiatedMemory {
    table: BlockTable,
}

impl NegotiatedMemory {
    /// Empty table.
    pub fn new() -> Self {
        Self { table: BlockTable::new(false, 0x0002_0000_0000) }
    }
}

impl Default for NegotiatedMemory {
    fn default() -> Self {
        Self::new()
    }
}

delegate_broker!(NegotiatedMemory, MemoryKind::Negotiated);

/// Unlock a block down to zero locks, then free it.
pub fn release(broker: &dyn MemoryBroker, handle: MemHandle) -> Result<(), MemoryError> {
    while broker.lock_count(handle)? > 0 {
        broker.unlock(handle)?;
    }
    broker.free(handle)
}

/// Owned handle released exactly once, on drop if not before.
pub struct ScopedBuffer {
    broker: Arc<dyn MemoryBroker>,
    handle: MemHandle,
    live: bool,
}

impl ScopedBuffer {
    /// Allocate a new block.
    pub fn allocate(broker: &Arc<dyn MemoryBroker>, size: usize) -> Result<Self, MemoryError> {
        let handle = broker.allocate(size)?;
        Ok(Self { broker: Arc::clone(broker), handle, live: true })
    }

    /// Take ownership of a block someone else allocated.
    pub fn adopt(broker: &Arc<dyn MemoryBroker>, handle: MemHandle) -> Self {
        Self { broker: Arc::clone(broker), handle, live: true }
    }

    /// Handle of the owned block.
    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    /// Size of the owned block.
    pub fn size(&self) -> Result<usize, MemoryError> {
        self.broker.size(self.handle)
    }

    /// Lock the block. The lock is released when the guard drops.
    pub fn lock(&self) -> Result<LockedBuffer<'_>, MemoryError> {
        self.broker.lock(self.handle)?;
        Ok(LockedBuffer { buffer: self })
    }

    /// Copy the whole block out under a temporary lock.
    pub fn read_all(&self) -> Result<Vec<u8>, MemoryError> {
        self.lock()?.bytes()
    }

    /// Unlock to zero and free now, reporting failures.
    pub fn release(mut self) -> Result<(), MemoryError> {
        self.live = false;
        release(self.broker.as_ref(), self.handle)
    }
}

impl fmt::Debug for ScopedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedBuffer")
            .field("kind", &self.broker.kind())
            .field("handle", &self.handle)
            .field("live", &self.live)
            .finish()
    }
}

impl Drop for ScopedBuffer {
    fn drop(&mut self) {
        if self.live {
            if let Err(error) = release(self.broker.as_ref(), self.handle) {
                tracing::warn!(handle = ?self.handle, %error, "failed to release buffer");
            }
        }
    }
}

/// A held lock on a [`ScopedBuffer`].
#[derive(Debug)]
pub struct LockedBuffer<'a> {
    buffer: &'a ScopedBuffer,
}

impl LockedBuffer<'_> {
    /// Copy the whole block out.
    pub fn bytes(&self) -> Result<Vec<u8>, MemoryError> {
        let size = self.buffer.size()?;
        self.read(0, size)
    }

    /// Copy `len` bytes out from `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.buffer.broker.read(self.buffer.handle, offset, len)
    }

    /// Copy bytes in at `offset`.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        self.buffer.broker.write(self.buffer.handle, offset, bytes)
    }
}

impl Drop for LockedBuffer<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.buffer.broker.unlock(self.buffer.handle) {
            tracing::warn!(handle = ?self.buffer.handle, %error, "failed to unlock buffer");
        }
    }
}

/// One decoded container item held in broker memory.
///
/// A slot has exactly one owner; it is not `Clone`. Taking the value out
/// releases the slot's block.
#[derive(Debug)]
pub struct ValueSlot {
    buffer: ScopedBuffer,
    item_type: ItemType,
}

impl ValueSlot {
    /// Copy one item's raw bytes into a fresh broker block.
    pub fn materialize(
        broker: &Arc<dyn MemoryBroker>,
        item_type: ItemType,
        bytes: &[u8],
    ) -> Result<Self, MemoryError> {
        let buffer = ScopedBuffer::allocate(broker, bytes.len())?;
        buffer.lock()?.write(0, bytes)?;
        Ok(Self { buffer, item_type })
    }

    /// Item type the slot decodes as.
    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    /// Decode the held item and release the slot.
    pub fn into_value(self) -> Result<CapValue, CapabilityError> {
        let bytes = self.buffer.read_all()?;
        let value = self.item_type.read_item(&bytes)?;
        self.buffer.release()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy() -> Arc<dyn MemoryBroker> {
        Arc::new(LegacyMemory::new())
    }

    fn negotiated() -> Arc<dyn MemoryBroker> {
        Arc::new(NegotiatedMemory::new())
    }

    #[test]
    fn legacy_locks_nest() {
        let memory = legacy();
        let handle = memory.allocate(8).unwrap();

        assert_eq!(memory.lock(handle).unwrap(), 1);
        assert_eq!(memory.lock(handle).unwrap(), 2);
        assert_eq!(memory.unlock(handle).unwrap(), 1);

        assert_eq!(
            memory.free(handle).unwrap_err(),
            MemoryError::FreeWhileLocked { handle, locks: 1 }
        );
        assert_eq!(memory.stats().rejected_frees, 1);

        release(memory.as_ref(), handle).unwrap();
        assert!(!memory.contains(handle));
        assert_eq!(memory.stats().live(), 0);
    }

    #[test]
    fn negotiated_lock_is_a_flag() {
        let memory = negotiated();
        let handle = memory.allocate(8).unwrap();

        assert_eq!(memory.lock(handle).unwrap(), 1);
        assert_eq!(memory.lock(handle).unwrap(), 1);
        assert_eq!(memory.unlock(handle).unwrap(), 0);
        assert_eq!(memory.unlock(handle).unwrap_err(), MemoryError::NotLocked(handle));
        memory.free(handle).unwrap();
    }

    #[test]
    fn access_requires_lock() {
        let memory = legacy();
        let handle = memory.allocate(4).unwrap();

        assert_eq!(memory.read(handle, 0, 4).unwrap_err(), MemoryError::NotLocked(handle));

        memory.lock(handle).unwrap();
        memory.write(handle, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(memory.read(handle, 1, 2).unwrap(), vec![2, 3]);
        assert!(matches!(memory.write(handle, 3, &[0, 0]), Err(MemoryError::OutOfBounds { .. })));
    }

    #[test]
    fn handles_do_not_collide_between_tables() {
        let a = legacy();
        let b = negotiated();
        let ha = a.allocate(1).unwrap();
        let hb = b.allocate(1).unwrap();

        assert!(a.contains(ha) && !a.contains(hb));
        assert!(b.contains(hb) && !b.contains(ha));
    }

    #[test]
    fn scoped_buffer_releases_on_drop_even_when_locked_twice() {
        let memory = legacy();
        let handle = {
            let buffer = ScopedBuffer::allocate(&memory, 16).unwrap();
            // Simulates a driver that left an extra lock behind
            memory.lock(buffer.handle()).unwrap();
            buffer.handle()
        };

        assert!(!memory.contains(handle));
        let stats = memory.stats();
        assert_eq!(stats.allocations, stats.frees);
        assert_eq!(stats.locks, stats.unlocks);
    }

    #[test]
    fn locked_guard_unlocks_on_drop() {
        let memory = negotiated();
        let buffer = ScopedBuffer::allocate(&memory, 4).unwrap();
        {
            let guard = buffer.lock().unwrap();
            guard.write(0, &[9, 9, 9, 9]).unwrap();
            assert_eq!(memory.lock_count(buffer.handle()).unwrap(), 1);
        }
        assert_eq!(memory.lock_count(buffer.handle()).unwrap(), 0);
        assert_eq!(buffer.read_all().unwrap(), vec![9; 4]);
        buffer.release().unwrap();
        assert_eq!(memory.stats().live(), 0);
    }

    #[test]
    fn value_slot_is_released_after_read() {
        let memory = legacy();
        let slot = ValueSlot::materialize(&memory, ItemType::Int16, &(-2i16).to_le_bytes()).unwrap();
        assert_eq!(memory.stats().live(), 1);

        assert_eq!(slot.into_value().unwrap(), CapValue::Int16(-2));
        assert_eq!(memory.stats().live(), 0);
    }

    #[test]
    fn oversized_allocation_is_refused() {
        let memory = negotiated();
        assert_eq!(
            memory.allocate(MAX_BLOCK + 1).unwrap_err(),
            MemoryError::AllocationFailed(MAX_BLOCK + 1)
        );
    }
}

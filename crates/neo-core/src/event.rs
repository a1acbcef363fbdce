//! Events: host- and device-visible completion flags living in an event pool allocation.
//!
//! Every event owns a slot of [`MAX_PACKETS`] packets. A packet holds four 64-bit fields in the
//! order context start, global start, context end, global end. A plain event only uses the
//! first field of each packet as its state word; a timestamp event treats the context end
//! field as its completion word, so the timestamp written at kernel end doubles as the signal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::allocation::{AllocationType, GraphicsAllocation};
use crate::error::{ZeError, ZeResult};
use crate::memory_manager::{AllocationProperties, MemoryManager};

pub const STATE_CLEARED: u32 = 1;
pub const STATE_SIGNALED: u32 = 0;

pub const EVENT_PACKET_SIZE: u64 = 32;
pub const MAX_PACKETS: u32 = 4;
pub const EVENT_SLOT_SIZE: u64 = EVENT_PACKET_SIZE * MAX_PACKETS as u64;

const CONTEXT_START: u64 = 0;
const GLOBAL_START: u64 = 8;
const CONTEXT_END: u64 = 16;
const GLOBAL_END: u64 = 24;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Scope {
    #[default]
    Device,
    Host,
}

/// Visibility required when the event is signaled and when it is waited on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EventScope {
    pub signal: Scope,
    pub wait: Scope,
}

impl EventScope {
    pub const HOST: EventScope = EventScope {
        signal: Scope::Host,
        wait: Scope::Host,
    };
    pub const DEVICE: EventScope = EventScope {
        signal: Scope::Device,
        wait: Scope::Device,
    };
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelTimestamp {
    pub global_start: u64,
    pub global_end: u64,
    pub context_start: u64,
    pub context_end: u64,
}

/// Field of a timestamp packet, used when encoding timestamp reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampField {
    ContextStart,
    GlobalStart,
    ContextEnd,
    GlobalEnd,
}

impl TimestampField {
    pub const ALL: [TimestampField; 4] = [
        TimestampField::GlobalStart,
        TimestampField::GlobalEnd,
        TimestampField::ContextStart,
        TimestampField::ContextEnd,
    ];

    pub fn offset(self) -> u64 {
        match self {
            TimestampField::ContextStart => CONTEXT_START,
            TimestampField::GlobalStart => GLOBAL_START,
            TimestampField::ContextEnd => CONTEXT_END,
            TimestampField::GlobalEnd => GLOBAL_END,
        }
    }
}

pub struct EventPool {
    allocation: Arc<GraphicsAllocation>,
    memory_manager: Arc<dyn MemoryManager>,
    count: u32,
    timestamp: bool,
}

impl EventPool {
    pub fn create(memory_manager: Arc<dyn MemoryManager>, count: u32, timestamp: bool) -> ZeResult<Arc<Self>> {
        if count == 0 {
            return Err(ZeError::InvalidSize);
        }
        let props = AllocationProperties::new(
            EVENT_SLOT_SIZE * u64::from(count),
            AllocationType::TimestampPacket,
        );
        let allocation = memory_manager
            .allocate_graphics_memory_with_properties(&props)
            .ok_or(ZeError::OutOfDeviceMemory)?;
        let pool = Self {
            allocation,
            memory_manager,
            count,
            timestamp,
        };
        for index in 0..count {
            pool.clear_slot(index);
        }
        debug!(count, timestamp, "event pool created");
        Ok(Arc::new(pool))
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_timestamp(&self) -> bool {
        self.timestamp
    }

    fn clear_slot(&self, index: u32) {
        let base = u64::from(index) * EVENT_SLOT_SIZE;
        for field in (0..EVENT_SLOT_SIZE).step_by(8) {
            self.allocation
                .write_u64(base + field, u64::from(STATE_CLEARED));
        }
    }

    pub fn create_event(self: &Arc<Self>, index: u32, scope: EventScope) -> ZeResult<Arc<Event>> {
        if index >= self.count {
            return Err(ZeError::InvalidArgument);
        }
        Ok(Arc::new(Event {
            pool: self.clone(),
            index,
            scope,
            packets_in_use: AtomicU32::new(1),
        }))
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        self.memory_manager
            .free_graphics_memory(self.allocation.clone());
    }
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPool")
            .field("count", &self.count)
            .field("timestamp", &self.timestamp)
            .field("allocation", &self.allocation.id())
            .finish()
    }
}

#[derive(Debug)]
pub struct Event {
    pool: Arc<EventPool>,
    index: u32,
    scope: EventScope,
    packets_in_use: AtomicU32,
}

impl Event {
    pub fn scope(&self) -> EventScope {
        self.scope
    }

    pub fn is_timestamp(&self) -> bool {
        self.pool.timestamp
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.pool.allocation
    }

    fn slot_offset(&self) -> u64 {
        u64::from(self.index) * EVENT_SLOT_SIZE
    }

    pub fn gpu_address(&self) -> u64 {
        self.pool.allocation.gpu_address() + self.slot_offset()
    }

    pub fn packet_address(&self, packet: u32) -> u64 {
        self.gpu_address() + u64::from(packet) * EVENT_PACKET_SIZE
    }

    fn completion_field(&self) -> u64 {
        if self.is_timestamp() {
            CONTEXT_END
        } else {
            CONTEXT_START
        }
    }

    /// Address of the word a signal writes and a wait polls, for `packet`.
    pub fn completion_address(&self, packet: u32) -> u64 {
        self.packet_address(packet) + self.completion_field()
    }

    pub fn timestamp_address(&self, packet: u32, field: TimestampField) -> u64 {
        self.packet_address(packet) + field.offset()
    }

    pub fn packets_in_use(&self) -> u32 {
        self.packets_in_use.load(Ordering::Acquire)
    }

    /// Record that the next signal writes `packets` packets, one per partition.
    pub fn set_packets_in_use(&self, packets: u32) {
        self.packets_in_use
            .store(packets.clamp(1, MAX_PACKETS), Ordering::Release);
    }

    fn host_offset(&self, packet: u32, field: u64) -> u64 {
        self.slot_offset() + u64::from(packet) * EVENT_PACKET_SIZE + field
    }

    pub fn host_signal(&self) {
        for packet in 0..self.packets_in_use() {
            self.pool.allocation.write_u64(
                self.host_offset(packet, self.completion_field()),
                u64::from(STATE_SIGNALED),
            );
        }
    }

    pub fn host_reset(&self) {
        self.pool.clear_slot(self.index);
        self.set_packets_in_use(1);
    }

    /// `Ok` once every packet in use was signaled, `NotReady` before.
    pub fn query_status(&self) -> ZeResult<()> {
        let field = self.completion_field();
        let signaled = (0..self.packets_in_use()).all(|packet| {
            self.pool
                .allocation
                .read_u32(self.host_offset(packet, field))
                .is_some_and(|v| v != STATE_CLEARED)
        });
        if signaled {
            Ok(())
        } else {
            Err(ZeError::NotReady)
        }
    }

    /// Poll [`Self::query_status`] until it succeeds or `timeout` elapses.
    pub fn host_synchronize(&self, timeout: Duration) -> ZeResult<()> {
        let start = Instant::now();
        let mut backoff = Duration::from_micros(1);
        loop {
            if self.query_status().is_ok() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(ZeError::NotReady);
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(1));
        }
    }

    /// Earliest start and latest end over the packets in use.
    pub fn query_kernel_timestamp(&self) -> ZeResult<KernelTimestamp> {
        if !self.is_timestamp() {
            return Err(ZeError::InvalidArgument);
        }
        self.query_status()?;
        let read = |packet, field| {
            self.pool
                .allocation
                .read_u64(self.host_offset(packet, field))
                .unwrap_or(0)
        };
        let mut result: Option<KernelTimestamp> = None;
        for packet in 0..self.packets_in_use() {
            let ts = KernelTimestamp {
                context_start: read(packet, CONTEXT_START),
                global_start: read(packet, GLOBAL_START),
                context_end: read(packet, CONTEXT_END),
                global_end: read(packet, GLOBAL_END),
            };
            result = Some(match result {
                None => ts,
                Some(acc) => KernelTimestamp {
                    global_start: acc.global_start.min(ts.global_start),
                    global_end: acc.global_end.max(ts.global_end),
                    context_start: acc.context_start.min(ts.context_start),
                    context_end: acc.context_end.max(ts.context_end),
                },
            });
        }
        result.ok_or(ZeError::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_manager::SimMemoryManager;

    fn pool(count: u32, timestamp: bool) -> (Arc<SimMemoryManager>, Arc<EventPool>) {
        let mm = Arc::new(SimMemoryManager::new());
        let pool = EventPool::create(mm.clone(), count, timestamp).unwrap();
        (mm, pool)
    }

    #[test]
    fn host_signal_and_reset() {
        let (_mm, pool) = pool(4, false);
        let event = pool.create_event(2, EventScope::HOST).unwrap();
        assert_eq!(event.query_status(), Err(ZeError::NotReady));
        assert_eq!(
            event.gpu_address(),
            pool.allocation().gpu_address() + 2 * EVENT_SLOT_SIZE
        );

        event.host_signal();
        assert_eq!(event.query_status(), Ok(()));
        event.host_reset();
        assert_eq!(event.query_status(), Err(ZeError::NotReady));
        assert_eq!(
            event.host_synchronize(Duration::from_millis(1)),
            Err(ZeError::NotReady)
        );
        assert_eq!(pool.create_event(4, EventScope::HOST).unwrap_err(), ZeError::InvalidArgument);
    }

    #[test]
    fn every_packet_in_use_must_be_signaled() {
        let (_mm, pool) = pool(1, false);
        let event = pool.create_event(0, EventScope::DEVICE).unwrap();
        event.set_packets_in_use(2);
        let offset = event.completion_address(0) - pool.allocation().gpu_address();
        pool.allocation()
            .write_u64(offset, u64::from(STATE_SIGNALED));
        assert_eq!(event.query_status(), Err(ZeError::NotReady));
        pool.allocation()
            .write_u64(offset + EVENT_PACKET_SIZE, u64::from(STATE_SIGNALED));
        assert_eq!(event.query_status(), Ok(()));
    }

    #[test]
    fn timestamp_event_completes_on_context_end() {
        let (_mm, pool) = pool(1, true);
        let event = pool.create_event(0, EventScope::HOST).unwrap();
        assert_eq!(
            event.completion_address(0),
            event.timestamp_address(0, TimestampField::ContextEnd)
        );
        assert_eq!(event.query_kernel_timestamp(), Err(ZeError::NotReady));

        let base = event.gpu_address() - pool.allocation().gpu_address();
        let alloc = pool.allocation();
        alloc.write_u64(base + CONTEXT_START, 100);
        alloc.write_u64(base + GLOBAL_START, 1100);
        alloc.write_u64(base + CONTEXT_END, 150);
        alloc.write_u64(base + GLOBAL_END, 1150);
        assert_eq!(
            event.query_kernel_timestamp(),
            Ok(KernelTimestamp {
                global_start: 1100,
                global_end: 1150,
                context_start: 100,
                context_end: 150,
            })
        );
    }

    #[test]
    fn pool_allocation_is_freed_on_drop() {
        let (mm, pool) = pool(2, false);
        let event = pool.create_event(0, EventScope::DEVICE).unwrap();
        drop(pool);
        assert_eq!(mm.live_allocations(), 1);
        drop(event);
        assert_eq!(mm.live_allocations(), 0);
    }
}

//! Barriers, event signals and waits, and timestamp queries.

use std::sync::Arc;

use neo_cmd::records::{
    FlushDwFlags, MiCopyMemMem, MiFlushDw, MiSemaphoreWait, MiStoreDataImm, MiStoreRegisterMem,
    PipeControl, PipeControlFlags, SemaphoreCompare,
};
use tracing::trace;

use super::{CommandList, MemoryRef};
use crate::device::EngineGroupType;
use crate::error::{ZeError, ZeResult};
use crate::event::{
    Event, KernelTimestamp, Scope, TimestampField, EVENT_SLOT_SIZE, STATE_CLEARED, STATE_SIGNALED,
};
use crate::hw::{PipeControlArgs, PostSyncArgs, REG_CONTEXT_TIMESTAMP_LOW, REG_GLOBAL_TIMESTAMP_LOW};

/// The first `count` events of `events`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitList<'a> {
    count: u32,
    events: &'a [Arc<Event>],
}

impl<'a> WaitList<'a> {
    pub fn new(count: u32, events: &'a [Arc<Event>]) -> Self {
        Self { count, events }
    }

    /// `InvalidArgument` when `count` exceeds the events provided.
    pub(crate) fn resolve(self) -> ZeResult<&'a [Arc<Event>]> {
        self.events
            .get(..self.count as usize)
            .ok_or(ZeError::InvalidArgument)
    }

    pub(crate) fn has_host_scope(self) -> bool {
        self.resolve()
            .is_ok_and(|events| events.iter().any(|e| e.scope().wait == Scope::Host))
    }
}

impl<'a> From<&'a [Arc<Event>]> for WaitList<'a> {
    fn from(events: &'a [Arc<Event>]) -> Self {
        Self {
            count: events.len() as u32,
            events,
        }
    }
}

const TIMESTAMP_SIZE: u64 = core::mem::size_of::<KernelTimestamp>() as u64;

impl CommandList {
    /// Stall until every earlier command of the list completed.
    pub fn append_barrier(&mut self, signal: Option<&Arc<Event>>, wait: WaitList<'_>) -> ZeResult<()> {
        self.record("append_barrier", |list| {
            let waits = wait.resolve()?;
            list.encode_waits(waits)?;
            match signal {
                Some(event) => list.encode_signal(event, false),
                None => list.encode_stall(false),
            }
        })
    }

    pub fn append_signal_event(&mut self, event: &Arc<Event>) -> ZeResult<()> {
        self.record("append_signal_event", |list| list.encode_signal(event, false))
    }

    /// Stall until every event in `events` is signaled.
    pub fn append_wait_on_events(&mut self, events: &[Arc<Event>]) -> ZeResult<()> {
        self.record("append_wait_on_events", |list| list.encode_waits(events))
    }

    /// Return `event` to the cleared state once the commands before it completed.
    pub fn append_event_reset(&mut self, event: &Arc<Event>) -> ZeResult<()> {
        self.record("append_event_reset", |list| {
            list.container.add_to_residency(event.allocation());
            list.encode_stall(false)?;
            let encoder = list.encoder;
            let fields = EVENT_SLOT_SIZE / 8;
            let arena = list.cs(core::mem::size_of::<MiStoreDataImm>() * fields as usize)?;
            for field in 0..fields {
                encoder.encode_store_data_imm(
                    arena,
                    event.gpu_address() + field * 8,
                    u64::from(STATE_CLEARED),
                    true,
                )?;
            }
            if event.scope().signal == Scope::Host {
                list.encode_stall(true)?;
            }
            Ok(())
        })
    }

    /// Copy the timestamps of `events` into `destination`, one [`KernelTimestamp`] per event at
    /// `offsets[i]`, or packed back to back without offsets.
    pub fn append_query_kernel_timestamps(
        &mut self,
        events: &[Arc<Event>],
        destination: &MemoryRef,
        offsets: Option<&[u64]>,
        signal: Option<&Arc<Event>>,
        wait: WaitList<'_>,
    ) -> ZeResult<()> {
        self.record("append_query_kernel_timestamps", |list| {
            let waits = wait.resolve()?;
            if events.iter().any(|e| !e.is_timestamp()) {
                return Err(ZeError::InvalidArgument);
            }
            if offsets.is_some_and(|o| o.len() != events.len()) {
                return Err(ZeError::InvalidArgument);
            }
            let offset_of = |i: usize| offsets.map_or(i as u64 * TIMESTAMP_SIZE, |o| o[i]);
            let extent = (0..events.len())
                .map(|i| offset_of(i) + TIMESTAMP_SIZE)
                .max()
                .unwrap_or(0);
            let (allocation, base) = list.resolve_memory(destination, extent)?;

            list.encode_waits(waits)?;
            list.encode_stall(false)?;
            let encoder = list.encoder;
            let arena = list.cs(core::mem::size_of::<MiCopyMemMem>() * 4 * events.len())?;
            for (i, event) in events.iter().enumerate() {
                let target = allocation.gpu_address() + base + offset_of(i);
                for field in TimestampField::ALL {
                    encoder.encode_copy_mem_mem(
                        arena,
                        target + field.offset(),
                        event.timestamp_address(0, field),
                    )?;
                }
            }
            for event in events {
                list.container.add_to_residency(event.allocation());
            }
            list.container.add_to_residency(&allocation);
            if let Some(event) = signal {
                list.encode_signal(event, wait.has_host_scope())?;
            }
            Ok(())
        })
    }

    /// Write the GPU's global timestamp to `destination` once earlier commands completed.
    pub fn append_write_global_timestamp(
        &mut self,
        destination: &MemoryRef,
        signal: Option<&Arc<Event>>,
        wait: WaitList<'_>,
    ) -> ZeResult<()> {
        self.record("append_write_global_timestamp", |list| {
            let waits = wait.resolve()?;
            let (allocation, offset) = list.resolve_memory(destination, 8)?;
            list.container.add_to_residency(&allocation);
            list.encode_waits(waits)?;
            let address = allocation.gpu_address() + offset;
            let encoder = list.encoder;
            match list.engine {
                EngineGroupType::Compute => {
                    let arena = list.cs(core::mem::size_of::<PipeControl>())?;
                    encoder.encode_pipe_control(
                        arena,
                        PipeControlArgs {
                            flags: PipeControlFlags::CS_STALL,
                            post_sync: Some(PostSyncArgs::write_timestamp(address)),
                        },
                    )?;
                }
                EngineGroupType::Copy => {
                    let arena = list.cs(core::mem::size_of::<MiFlushDw>())?;
                    encoder.encode_mi_flush_dw(
                        arena,
                        FlushDwFlags::empty(),
                        Some(PostSyncArgs::write_timestamp(address)),
                    )?;
                }
            }
            if let Some(event) = signal {
                list.encode_signal(event, false)?;
            }
            Ok(())
        })
    }

    /// Semaphore waits on every packet of every event, plus a flush when one of them is
    /// waited on from the host's side.
    pub(super) fn encode_waits(&mut self, events: &[Arc<Event>]) -> ZeResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let encoder = self.encoder;
        let packets: u32 = events.iter().map(|e| e.packets_in_use()).sum();
        let arena = self.cs(core::mem::size_of::<MiSemaphoreWait>() * packets as usize)?;
        for event in events {
            for packet in 0..event.packets_in_use() {
                encoder.encode_semaphore_wait(
                    arena,
                    event.completion_address(packet),
                    STATE_CLEARED,
                    SemaphoreCompare::SadNotEqualSdd,
                )?;
            }
        }
        for event in events {
            self.container.add_to_residency(event.allocation());
        }
        if events.iter().any(|e| e.scope().wait == Scope::Host) {
            self.encode_stall(true)?;
        }
        trace!(events = events.len(), packets, "waits encoded");
        Ok(())
    }

    /// Command-streamer stall, with a cache flush when `dc_flush`.
    pub(super) fn encode_stall(&mut self, dc_flush: bool) -> ZeResult<()> {
        let encoder = self.encoder;
        match self.engine {
            EngineGroupType::Compute => {
                let mut flags = PipeControlFlags::CS_STALL;
                if dc_flush {
                    flags |= encoder.dc_flush_flags();
                }
                let arena = self.cs(core::mem::size_of::<PipeControl>())?;
                encoder.encode_pipe_control(arena, PipeControlArgs { flags, post_sync: None })
            }
            EngineGroupType::Copy => {
                let flags = if dc_flush {
                    FlushDwFlags::LLC_FLUSH
                } else {
                    FlushDwFlags::empty()
                };
                let arena = self.cs(core::mem::size_of::<MiFlushDw>())?;
                encoder.encode_mi_flush_dw(arena, flags, None)
            }
        }
    }

    pub(super) fn signal_needs_flush(&self, event: &Event, dc_flush: bool) -> bool {
        dc_flush || event.scope().signal == Scope::Host || self.device.config().force_dc_flush
    }

    fn encode_timestamp_read(&mut self, register: u32, address: u64) -> ZeResult<()> {
        let encoder = self.encoder;
        let arena = self.cs(core::mem::size_of::<MiStoreRegisterMem>())?;
        encoder.encode_store_register_mem(arena, register, address)
    }

    /// Global and context start of a timestamp event.
    /// Written for every packet in use, so each partition's packet holds a full timestamp.
    pub(super) fn encode_timestamp_start(&mut self, event: &Event) -> ZeResult<()> {
        for packet in 0..event.packets_in_use() {
            self.encode_timestamp_read(
                REG_GLOBAL_TIMESTAMP_LOW,
                event.timestamp_address(packet, TimestampField::GlobalStart),
            )?;
            self.encode_timestamp_read(
                REG_CONTEXT_TIMESTAMP_LOW,
                event.timestamp_address(packet, TimestampField::ContextStart),
            )?;
        }
        Ok(())
    }

    fn encode_timestamp_end(&mut self, event: &Event) -> ZeResult<()> {
        for packet in 0..event.packets_in_use() {
            self.encode_timestamp_read(
                REG_GLOBAL_TIMESTAMP_LOW,
                event.timestamp_address(packet, TimestampField::GlobalEnd),
            )?;
        }
        Ok(())
    }

    /// Completes a signal whose dispatch already carried the walker post-sync, if any.
    pub(super) fn encode_signal_after(&mut self, event: &Arc<Event>, dc_flush: bool) -> ZeResult<()> {
        let flush = self.signal_needs_flush(event, dc_flush);
        if event.is_timestamp() {
            self.encode_timestamp_end(event)?;
            if flush {
                self.encode_stall(true)?;
            }
            return Ok(());
        }
        if flush {
            self.encode_signal_packets(event, true)?;
        }
        Ok(())
    }

    /// Signal `event` once every earlier command completed.
    pub(super) fn encode_signal(&mut self, event: &Arc<Event>, dc_flush: bool) -> ZeResult<()> {
        self.container.add_to_residency(event.allocation());
        event.set_packets_in_use(1);
        let flush = self.signal_needs_flush(event, dc_flush);
        if !event.is_timestamp() {
            return self.encode_signal_packets(event, flush);
        }
        self.encode_timestamp_start(event)?;
        self.encode_timestamp_end(event)?;
        self.encode_completion_write(
            PostSyncArgs::write_timestamp(event.timestamp_address(0, TimestampField::ContextEnd)),
            flush,
        )
    }

    fn encode_signal_packets(&mut self, event: &Event, flush: bool) -> ZeResult<()> {
        for packet in 0..event.packets_in_use() {
            self.encode_completion_write(
                PostSyncArgs::write_immediate(
                    event.completion_address(packet),
                    u64::from(STATE_SIGNALED),
                ),
                flush && packet == 0,
            )?;
        }
        Ok(())
    }

    fn encode_completion_write(&mut self, post_sync: PostSyncArgs, flush: bool) -> ZeResult<()> {
        let encoder = self.encoder;
        match self.engine {
            EngineGroupType::Compute => {
                let mut flags = PipeControlFlags::CS_STALL;
                if flush {
                    flags |= encoder.dc_flush_flags();
                }
                let arena = self.cs(core::mem::size_of::<PipeControl>())?;
                encoder.encode_pipe_control(
                    arena,
                    PipeControlArgs {
                        flags,
                        post_sync: Some(post_sync),
                    },
                )
            }
            EngineGroupType::Copy => {
                let flags = if flush {
                    FlushDwFlags::LLC_FLUSH
                } else {
                    FlushDwFlags::empty()
                };
                let arena = self.cs(core::mem::size_of::<MiFlushDw>())?;
                encoder.encode_mi_flush_dw(arena, flags, Some(post_sync))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::allocation::AllocationType;
    use crate::config::DriverConfig;
    use crate::event::EventScope;
    use crate::hw::HwFamily;
    use neo_cmd::parse::{count_opcode, parse_cmd_stream, ParsedCmd};
    use neo_cmd::records::CmdOpcode;
    use pretty_assertions::assert_eq;

    fn cmds(list: &CommandList) -> Vec<ParsedCmd> {
        parse_cmd_stream(list.container().command_buffers()[0].as_bytes()).unwrap()
    }

    #[test]
    fn wait_list_count_must_not_exceed_the_events() {
        let device = device(HwFamily::XeHpCore, DriverConfig::default());
        let pool = device.create_event_pool(2, false).unwrap();
        let events = vec![pool.create_event(0, EventScope::DEVICE).unwrap()];
        assert_eq!(WaitList::new(1, &events).resolve().unwrap().len(), 1);
        assert_eq!(WaitList::new(2, &events).resolve().unwrap_err(), ZeError::InvalidArgument);
        assert!(WaitList::default().resolve().unwrap().is_empty());

        let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();
        assert_eq!(
            list.append_barrier(None, WaitList::new(3, &events)),
            Err(ZeError::InvalidArgument)
        );
        assert!(!list.is_poisoned());
    }

    #[test]
    fn waits_poll_every_packet_in_use() {
        let device = device(HwFamily::XeHpCore, DriverConfig::default());
        let pool = device.create_event_pool(2, false).unwrap();
        let device_event = pool.create_event(0, EventScope::DEVICE).unwrap();
        let host_event = pool.create_event(1, EventScope::HOST).unwrap();
        host_event.set_packets_in_use(2);

        let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();
        list.append_wait_on_events(&[device_event.clone()]).unwrap();
        assert_eq!(count_opcode(&cmds(&list), CmdOpcode::MiSemaphoreWait), 1);
        assert_eq!(count_opcode(&cmds(&list), CmdOpcode::PipeControl), 0);

        list.append_wait_on_events(&[host_event.clone()]).unwrap();
        let parsed = cmds(&list);
        assert_eq!(count_opcode(&parsed, CmdOpcode::MiSemaphoreWait), 3);
        let ParsedCmd::PipeControl(flush) = parsed[parsed.len() - 1] else {
            panic!("expected a flush after host-scope waits");
        };
        assert!(flush.pipe_control_flags().contains(PipeControlFlags::CS_STALL));
        let ParsedCmd::MiSemaphoreWait(last) = parsed[parsed.len() - 2] else {
            panic!("expected a semaphore wait");
        };
        assert_eq!(last.address, host_event.completion_address(1));
        assert_eq!(last.value, STATE_CLEARED);
    }

    #[test]
    fn host_scope_signal_flushes_before_writing() {
        let device = device(HwFamily::XeHpCore, DriverConfig::default());
        let pool = device.create_event_pool(1, false).unwrap();
        let event = pool.create_event(0, EventScope::HOST).unwrap();
        let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();
        list.append_signal_event(&event).unwrap();
        let parsed = cmds(&list);
        assert_eq!(parsed.len(), 1);
        let ParsedCmd::PipeControl(pc) = parsed[0] else {
            panic!("expected PIPE_CONTROL, got {:?}", parsed[0]);
        };
        assert!(pc.pipe_control_flags().contains(PipeControlFlags::DC_FLUSH));
        assert_eq!(pc.address, event.completion_address(0));
        assert_eq!(pc.immediate_data, u64::from(STATE_SIGNALED));
    }

    #[test]
    fn event_reset_clears_the_whole_slot() {
        let device = device(HwFamily::XeHpCore, DriverConfig::default());
        let pool = device.create_event_pool(2, true).unwrap();
        let event = pool.create_event(1, EventScope::DEVICE).unwrap();
        let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();
        list.append_event_reset(&event).unwrap();
        let stores: Vec<_> = cmds(&list)
            .into_iter()
            .filter_map(|c| match c {
                ParsedCmd::MiStoreDataImm(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(stores.len() as u64, EVENT_SLOT_SIZE / 8);
        assert_eq!(stores[0].address, event.gpu_address());
        assert!(stores.iter().all(|s| s.data == u64::from(STATE_CLEARED) && s.store_qword == 1));
    }

    #[test]
    fn kernel_timestamp_query_copies_every_field() {
        let device = device(HwFamily::XeHpCore, DriverConfig::default());
        let timestamps = device.create_event_pool(2, true).unwrap();
        let plain = device.create_event_pool(1, false).unwrap();
        let events = vec![
            timestamps.create_event(0, EventScope::DEVICE).unwrap(),
            timestamps.create_event(1, EventScope::DEVICE).unwrap(),
        ];
        let destination = device.allocate(256, AllocationType::Buffer).unwrap();
        let target = MemoryRef::device(&destination, 0);
        let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();

        list.append_query_kernel_timestamps(&events, &target, Some(&[0, 128]), None, WaitList::default())
            .unwrap();
        let copies: Vec<_> = cmds(&list)
            .into_iter()
            .filter_map(|c| match c {
                ParsedCmd::MiCopyMemMem(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(copies.len(), 8);
        assert_eq!(copies[4].destination, destination.gpu_address() + 128 + 8);
        assert_eq!(
            copies[4].source,
            events[1].timestamp_address(0, TimestampField::GlobalStart)
        );

        let mismatched = list.append_query_kernel_timestamps(
            &events,
            &target,
            Some(&[0]),
            None,
            WaitList::default(),
        );
        assert_eq!(mismatched, Err(ZeError::InvalidArgument));
        let not_timestamp = vec![plain.create_event(0, EventScope::DEVICE).unwrap()];
        assert_eq!(
            list.append_query_kernel_timestamps(&not_timestamp, &target, None, None, WaitList::default()),
            Err(ZeError::InvalidArgument)
        );
        assert_eq!(
            list.append_query_kernel_timestamps(&events, &target, Some(&[0, 240]), None, WaitList::default()),
            Err(ZeError::InvalidSize)
        );
    }

    #[test]
    fn copy_engine_signals_with_flush_dw() {
        let device = device(HwFamily::XeHpCore, DriverConfig::default());
        let pool = device.create_event_pool(1, false).unwrap();
        let event = pool.create_event(0, EventScope::HOST).unwrap();
        let mut list = CommandList::create(&device, EngineGroupType::Copy).unwrap();
        list.append_barrier(Some(&event), WaitList::default()).unwrap();
        let parsed = cmds(&list);
        let ParsedCmd::MiFlushDw(flush) = parsed[0] else {
            panic!("expected MI_FLUSH_DW, got {:?}", parsed[0]);
        };
        assert_eq!(flush.flags, FlushDwFlags::LLC_FLUSH.bits());
        assert_eq!(flush.address, event.completion_address(0));
    }
}

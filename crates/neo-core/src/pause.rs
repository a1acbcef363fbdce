//! Opt-in operator pause around each submitted workload.
//!
//! The CSR brackets the workload of a submission with records that publish a "waiting" state
//! into the pause slot of its tag allocation and then stall on a semaphore until the slot holds
//! the matching confirmation. A background thread watches the slot, asks the operator, and
//! writes the confirmation.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use neo_cmd::records::SemaphoreCompare;
use neo_cmd::CmdArena;
use tracing::{debug, warn};

use crate::allocation::GraphicsAllocation;
use crate::error::ZeResult;
use crate::hw::CommandEncoder;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PauseConfig {
    pub before_workload: bool,
    pub after_workload: bool,
}

/// Values of the pause slot.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseState {
    Idle = 0,
    WaitingForStartConfirmation = 1,
    HasStartConfirmation = 2,
    WaitingForEndConfirmation = 3,
    HasEndConfirmation = 4,
}

impl PauseState {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Idle),
            1 => Some(Self::WaitingForStartConfirmation),
            2 => Some(Self::HasStartConfirmation),
            3 => Some(Self::WaitingForEndConfirmation),
            4 => Some(Self::HasEndConfirmation),
            _ => None,
        }
    }
}

/// Where pause prompts go and confirmations come from.
pub trait OperatorIo: Send + Sync {
    /// Show `message` and block until the operator confirms.
    fn confirm(&self, message: &str);
}

/// Prompts on stdout and waits for a line on stdin.
#[derive(Debug, Default)]
pub struct StdioOperator;

impl OperatorIo for StdioOperator {
    fn confirm(&self, message: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{message}");
        let _ = out.flush();
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
    }
}

/// Encode the records that publish `waiting` and stall until the slot holds `confirmed`.
pub fn encode_pause_point(
    encoder: &dyn CommandEncoder,
    arena: &mut CmdArena,
    slot_address: u64,
    waiting: PauseState,
    confirmed: PauseState,
) -> ZeResult<()> {
    encoder.encode_store_data_imm(arena, slot_address, waiting as u64, false)?;
    encoder.encode_semaphore_wait(arena, slot_address, confirmed as u32, SemaphoreCompare::SadEqualSdd)
}

pub fn pause_point_size() -> usize {
    core::mem::size_of::<neo_cmd::records::MiStoreDataImm>()
        + core::mem::size_of::<neo_cmd::records::MiSemaphoreWait>()
}

/// Handle of the watcher thread. Dropping it stops and joins the thread.
pub struct PauseThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

const POLL_INTERVAL: Duration = Duration::from_micros(200);

impl PauseThread {
    pub fn spawn(
        tag: Arc<GraphicsAllocation>,
        slot_offset: u64,
        operator: Arc<dyn OperatorIo>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("neo-pause".into())
            .spawn(move || watch(&tag, slot_offset, operator.as_ref(), &thread_stop))?;
        debug!("pause thread started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

fn watch(tag: &GraphicsAllocation, slot_offset: u64, operator: &dyn OperatorIo, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let state = tag.read_u32(slot_offset).and_then(PauseState::from_u32);
        match state {
            Some(PauseState::WaitingForStartConfirmation) => {
                operator.confirm("Press enter to start workload");
                tag.write_u32(slot_offset, PauseState::HasStartConfirmation as u32);
            }
            Some(PauseState::WaitingForEndConfirmation) => {
                operator.confirm("Workload ended, press enter to continue");
                tag.write_u32(slot_offset, PauseState::HasEndConfirmation as u32);
            }
            _ => std::thread::sleep(POLL_INTERVAL),
        }
    }
}

impl Drop for PauseThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("pause thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for PauseThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseThread")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

/// Confirms immediately and records every prompt.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    prompts: std::sync::Mutex<Vec<String>>,
}

impl ScriptedOperator {
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl OperatorIo for ScriptedOperator {
    fn confirm(&self, message: &str) {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationId, AllocationType};
    use crate::hw::{encoder_for, HwFamily};
    use std::time::Instant;

    #[test]
    fn pause_point_publishes_and_waits() {
        let mut arena = CmdArena::with_capacity(128);
        let encoder = encoder_for(HwFamily::XeHpCore);
        encode_pause_point(
            encoder,
            &mut arena,
            0x1800,
            PauseState::WaitingForStartConfirmation,
            PauseState::HasStartConfirmation,
        )
        .unwrap();
        assert_eq!(arena.used(), pause_point_size());
        let cmds = neo_cmd::parse_cmd_stream(arena.as_bytes()).unwrap();
        let neo_cmd::ParsedCmd::MiSemaphoreWait(wait) = cmds[1] else {
            panic!("expected MI_SEMAPHORE_WAIT, got {:?}", cmds[1]);
        };
        assert_eq!(wait.value, PauseState::HasStartConfirmation as u32);
    }

    #[test]
    fn thread_confirms_waiting_states() {
        let tag = Arc::new(GraphicsAllocation::new(
            AllocationId(1),
            AllocationType::TagBuffer,
            0x1000,
            4096,
            true,
        ));
        let operator = Arc::new(ScriptedOperator::default());
        let thread = PauseThread::spawn(tag.clone(), 2048, operator.clone()).unwrap();

        tag.write_u32(2048, PauseState::WaitingForStartConfirmation as u32);
        let deadline = Instant::now() + Duration::from_secs(5);
        while tag.read_u32(2048) != Some(PauseState::HasStartConfirmation as u32) {
            assert!(Instant::now() < deadline, "pause thread did not confirm");
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(thread);
        assert_eq!(operator.prompts().len(), 1);
    }
}

//! Decoder for encoded command buffers.

use crate::records::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CmdStreamParseError {
    #[error("truncated record header at offset {offset}")]
    TruncatedHeader { offset: usize },
    #[error("record at offset {offset} has invalid size_bytes={size_bytes}")]
    InvalidSize { offset: usize, size_bytes: u32 },
    #[error("record at offset {offset} overruns the stream (size_bytes={size_bytes}, stream_len={stream_len})")]
    Overrun {
        offset: usize,
        size_bytes: u32,
        stream_len: usize,
    },
    #[error("unknown opcode 0x{opcode:X} at offset {offset}")]
    UnknownOpcode { offset: usize, opcode: u32 },
}

/// A decoded command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedCmd {
    MiNoop,
    MiBatchBufferEnd,
    MiBatchBufferStart(MiBatchBufferStart),
    MiSemaphoreWait(MiSemaphoreWait),
    MiStoreDataImm(MiStoreDataImm),
    MiStoreRegisterMem(MiStoreRegisterMem),
    MiCopyMemMem(MiCopyMemMem),
    MiFlushDw(MiFlushDw),
    PipeControl(PipeControl),
    StateBaseAddress(StateBaseAddress),
    StateSip(StateSip),
    StateComputeMode(StateComputeMode),
    CfeState(CfeState),
    PipelineSelect(PipelineSelect),
    MediaInterfaceDescriptorLoad(MediaInterfaceDescriptorLoad),
    GpgpuWalker(GpgpuWalker),
    ComputeWalker(ComputeWalker),
    XyCopyBlt(XyCopyBlt),
    XyColorBlt(XyColorBlt),
}

impl ParsedCmd {
    pub fn opcode(&self) -> CmdOpcode {
        match self {
            ParsedCmd::MiNoop => CmdOpcode::MiNoop,
            ParsedCmd::MiBatchBufferEnd => CmdOpcode::MiBatchBufferEnd,
            ParsedCmd::MiBatchBufferStart(_) => CmdOpcode::MiBatchBufferStart,
            ParsedCmd::MiSemaphoreWait(_) => CmdOpcode::MiSemaphoreWait,
            ParsedCmd::MiStoreDataImm(_) => CmdOpcode::MiStoreDataImm,
            ParsedCmd::MiStoreRegisterMem(_) => CmdOpcode::MiStoreRegisterMem,
            ParsedCmd::MiCopyMemMem(_) => CmdOpcode::MiCopyMemMem,
            ParsedCmd::MiFlushDw(_) => CmdOpcode::MiFlushDw,
            ParsedCmd::PipeControl(_) => CmdOpcode::PipeControl,
            ParsedCmd::StateBaseAddress(_) => CmdOpcode::StateBaseAddress,
            ParsedCmd::StateSip(_) => CmdOpcode::StateSip,
            ParsedCmd::StateComputeMode(_) => CmdOpcode::StateComputeMode,
            ParsedCmd::CfeState(_) => CmdOpcode::CfeState,
            ParsedCmd::PipelineSelect(_) => CmdOpcode::PipelineSelect,
            ParsedCmd::MediaInterfaceDescriptorLoad(_) => CmdOpcode::MediaInterfaceDescriptorLoad,
            ParsedCmd::GpgpuWalker(_) => CmdOpcode::GpgpuWalker,
            ParsedCmd::ComputeWalker(_) => CmdOpcode::ComputeWalker,
            ParsedCmd::XyCopyBlt(_) => CmdOpcode::XyCopyBlt,
            ParsedCmd::XyColorBlt(_) => CmdOpcode::XyColorBlt,
        }
    }
}

fn decode<T: CmdRecord>(
    bytes: &[u8],
    offset: usize,
    size_bytes: u32,
) -> Result<T, CmdStreamParseError> {
    if size_bytes as usize != core::mem::size_of::<T>() {
        return Err(CmdStreamParseError::InvalidSize { offset, size_bytes });
    }
    Ok(bytemuck::pod_read_unaligned(
        &bytes[offset..offset + size_bytes as usize],
    ))
}

/// Decode the record at `offset`, returning it with its size in bytes.
pub fn parse_cmd_at(bytes: &[u8], offset: usize) -> Result<(ParsedCmd, usize), CmdStreamParseError> {
    if offset >= bytes.len() || bytes.len() - offset < CmdHeader::SIZE_BYTES {
        return Err(CmdStreamParseError::TruncatedHeader { offset });
    }
    let hdr: CmdHeader = bytemuck::pod_read_unaligned(&bytes[offset..offset + CmdHeader::SIZE_BYTES]);
    let size_bytes = hdr.size_bytes;
    if (size_bytes as usize) < CmdHeader::SIZE_BYTES || size_bytes % 4 != 0 {
        return Err(CmdStreamParseError::InvalidSize { offset, size_bytes });
    }
    if size_bytes as usize > bytes.len() - offset {
        return Err(CmdStreamParseError::Overrun {
            offset,
            size_bytes,
            stream_len: bytes.len(),
        });
    }

    let Some(opcode) = CmdOpcode::from_u32(hdr.opcode) else {
        return Err(CmdStreamParseError::UnknownOpcode {
            offset,
            opcode: hdr.opcode,
        });
    };

    let cmd = match opcode {
        CmdOpcode::MiNoop => ParsedCmd::MiNoop,
        CmdOpcode::MiBatchBufferEnd => ParsedCmd::MiBatchBufferEnd,
        CmdOpcode::MiBatchBufferStart => ParsedCmd::MiBatchBufferStart(decode(bytes, offset, size_bytes)?),
        CmdOpcode::MiSemaphoreWait => ParsedCmd::MiSemaphoreWait(decode(bytes, offset, size_bytes)?),
        CmdOpcode::MiStoreDataImm => ParsedCmd::MiStoreDataImm(decode(bytes, offset, size_bytes)?),
        CmdOpcode::MiStoreRegisterMem => {
            ParsedCmd::MiStoreRegisterMem(decode(bytes, offset, size_bytes)?)
        }
        CmdOpcode::MiCopyMemMem => ParsedCmd::MiCopyMemMem(decode(bytes, offset, size_bytes)?),
        CmdOpcode::MiFlushDw => ParsedCmd::MiFlushDw(decode(bytes, offset, size_bytes)?),
        CmdOpcode::PipeControl => ParsedCmd::PipeControl(decode(bytes, offset, size_bytes)?),
        CmdOpcode::StateBaseAddress => ParsedCmd::StateBaseAddress(decode(bytes, offset, size_bytes)?),
        CmdOpcode::StateSip => ParsedCmd::StateSip(decode(bytes, offset, size_bytes)?),
        CmdOpcode::StateComputeMode => ParsedCmd::StateComputeMode(decode(bytes, offset, size_bytes)?),
        CmdOpcode::CfeState => ParsedCmd::CfeState(decode(bytes, offset, size_bytes)?),
        CmdOpcode::PipelineSelect => ParsedCmd::PipelineSelect(decode(bytes, offset, size_bytes)?),
        CmdOpcode::MediaInterfaceDescriptorLoad => {
            ParsedCmd::MediaInterfaceDescriptorLoad(decode(bytes, offset, size_bytes)?)
        }
        CmdOpcode::GpgpuWalker => ParsedCmd::GpgpuWalker(decode(bytes, offset, size_bytes)?),
        CmdOpcode::ComputeWalker => ParsedCmd::ComputeWalker(decode(bytes, offset, size_bytes)?),
        CmdOpcode::XyCopyBlt => ParsedCmd::XyCopyBlt(decode(bytes, offset, size_bytes)?),
        CmdOpcode::XyColorBlt => ParsedCmd::XyColorBlt(decode(bytes, offset, size_bytes)?),
    };
    Ok((cmd, size_bytes as usize))
}

/// Walk `bytes` record by record.
///
/// Walking stops after the first `MI_BATCH_BUFFER_END`; anything past it is not executed by the
/// command streamer and is ignored here as well.
pub fn parse_cmd_stream(bytes: &[u8]) -> Result<Vec<ParsedCmd>, CmdStreamParseError> {
    let mut cmds = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let (cmd, size) = parse_cmd_at(bytes, offset)?;
        offset += size;
        let end = matches!(cmd, ParsedCmd::MiBatchBufferEnd);
        cmds.push(cmd);
        if end {
            break;
        }
    }
    Ok(cmds)
}

/// Number of records with `opcode` in `cmds`.
pub fn count_opcode(cmds: &[ParsedCmd], opcode: CmdOpcode) -> usize {
    cmds.iter().filter(|cmd| cmd.opcode() == opcode).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CmdArena;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_records_in_order_and_stops_at_batch_buffer_end() {
        let mut arena = CmdArena::with_capacity(256);
        arena
            .write(PipeControl {
                flags: (PipeControlFlags::DC_FLUSH | PipeControlFlags::CS_STALL).bits(),
                ..Default::default()
            })
            .unwrap();
        arena.write(MiNoop::default()).unwrap();
        arena.write(MiBatchBufferEnd::default()).unwrap();
        arena.write(MiNoop::default()).unwrap();

        let cmds = parse_cmd_stream(arena.as_bytes()).unwrap();
        assert_eq!(cmds.len(), 3);
        let ParsedCmd::PipeControl(pc) = cmds[0] else {
            panic!("expected PIPE_CONTROL, got {:?}", cmds[0]);
        };
        assert!(pc.pipe_control_flags().contains(PipeControlFlags::DC_FLUSH));
        assert_eq!(cmds[2], ParsedCmd::MiBatchBufferEnd);
    }

    #[test]
    fn parse_at_reports_record_size() {
        let mut arena = CmdArena::with_capacity(64);
        arena.write(MiNoop::default()).unwrap();
        let bbs = arena
            .write(MiBatchBufferStart {
                address: 0x2000,
                ..Default::default()
            })
            .unwrap();
        let (cmd, size) = parse_cmd_at(arena.as_bytes(), bbs).unwrap();
        assert_eq!(size, 16);
        assert!(matches!(cmd, ParsedCmd::MiBatchBufferStart(b) if b.address == 0x2000));
        assert_eq!(
            parse_cmd_at(arena.as_bytes(), arena.used()),
            Err(CmdStreamParseError::TruncatedHeader { offset: 24 })
        );
    }

    #[test]
    fn rejects_malformed_streams() {
        assert_eq!(
            parse_cmd_stream(&[0u8; 4]),
            Err(CmdStreamParseError::TruncatedHeader { offset: 0 })
        );

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(CmdOpcode::MiNoop as u32).to_le_bytes());
        bytes.extend_from_slice(&6u32.to_le_bytes());
        assert_eq!(
            parse_cmd_stream(&bytes),
            Err(CmdStreamParseError::InvalidSize {
                offset: 0,
                size_bytes: 6
            })
        );

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xDEADu32.to_le_bytes());
        bytes.extend_from_slice(&8u32.to_le_bytes());
        assert_eq!(
            parse_cmd_stream(&bytes),
            Err(CmdStreamParseError::UnknownOpcode {
                offset: 0,
                opcode: 0xDEAD
            })
        );

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(CmdOpcode::PipeControl as u32).to_le_bytes());
        bytes.extend_from_slice(&32u32.to_le_bytes());
        assert!(matches!(
            parse_cmd_stream(&bytes),
            Err(CmdStreamParseError::Overrun { .. })
        ));
    }
}

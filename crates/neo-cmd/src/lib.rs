//! Binary command records for the compute command streamer.
//!
//! This crate owns everything that is bit-level about a command buffer:
//! - fixed-layout records with a common [`CmdHeader`] (see [`records`]),
//! - [`CmdArena`], the bounds-checked append-only writer that command lists and the command
//!   stream receiver encode into,
//! - [`parse_cmd_stream`], a decoder used by tests and tooling to walk an encoded buffer.
//!
//! Nothing here knows about allocations, heaps or submission; addresses are plain `u64` GPU
//! virtual addresses supplied by the caller.

mod arena;
pub mod parse;
pub mod records;

pub use arena::{ArenaError, CmdArena};
pub use parse::{count_opcode, parse_cmd_at, parse_cmd_stream, CmdStreamParseError, ParsedCmd};
pub use records::{CmdHeader, CmdOpcode, CmdRecord};

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a power of two.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + (alignment - 1)) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(4095, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}

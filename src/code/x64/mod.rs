//! x86-64 helpers for rewriting a target's entry and preserving its prologue

use std::mem;
use std::slice;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, IcedError,
    InstructionBlock,
};
use thiserror::Error;

/// Longest encodable x86 instruction
const MAX_INSTR_LEN: usize = 15;

/// Size of the indirect jump written over a target's entry
pub const JMP_IND_SIZE: usize = mem::size_of::<JmpInd>();

/// Size of the absolute jump appended to a trampoline
pub const JMP_ABS_SIZE: usize = mem::size_of::<JmpAbs>();

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute jump
struct JmpAbs {
    /// Absolute jmp instruction (jmp [rip + 0])
    jmp: [u8; 6],
    /// Absolute address to jump to
    target: usize,
}

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_SIZE] {
    unsafe {
        mem::transmute(JmpAbs {
            jmp: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            target,
        })
    }
}

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating a rip-relative indirect jump
struct JmpInd {
    /// Indirect jmp opcode (jmp [rip + disp32])
    jmp: [u8; 2],
    /// Displacement from the end of the instruction to the destination cell
    disp: i32,
}

/// Generates an indirect jump through the cell at `disp` bytes past the end
/// of the instruction and returns bytecode
pub fn jmp_indirect(disp: i32) -> [u8; JMP_IND_SIZE] {
    unsafe {
        mem::transmute(JmpInd {
            jmp: [0xff, 0x25],
            disp,
        })
    }
}

/// Computes the rip-relative displacement from the instruction ending at
/// `next_ip` to `dest`, if it fits in 32 bits
pub fn rip_disp(next_ip: usize, dest: usize) -> Option<i32> {
    i32::try_from((dest as isize).wrapping_sub(next_ip as isize)).ok()
}

/// Errors while relocating a target's prologue
#[derive(Debug, Error)]
pub enum RelocateError {
    /// The prologue contains bytes that do not decode as instructions
    #[error("entry prologue contains an undecodable instruction")]
    Undecodable,
    /// The target's body ends before the redirection patch site
    #[error("entry is too small to host a redirection")]
    TooSmall,
    /// The prologue could not be re-encoded at the trampoline address
    #[error("{0}")]
    Encode(#[from] IcedError),
}

/// Decodes whole instructions at `src` until at least `min_len` bytes are
/// covered, then re-encodes them as if they lived at `dest_ip`.
///
/// Returns the re-encoded bytes and the number of bytes consumed at `src`.
/// Rip-relative operands and branches are fixed up by the encoder, which is
/// why `dest_ip` must be the address the bytes will actually run at.
///
/// # Safety
///
/// `src` must be valid for reads of `min_len + 14` bytes (enough to finish
/// decoding an instruction whose first byte sits at `min_len - 1`).
pub unsafe fn steal_prologue(
    src: *const u8,
    min_len: usize,
    dest_ip: u64,
) -> Result<(Vec<u8>, usize), RelocateError> {
    let buf = slice::from_raw_parts(src, min_len + MAX_INSTR_LEN - 1);
    let mut decoder = Decoder::with_ip(64, buf, src as u64, DecoderOptions::NONE);

    let mut instructions = Vec::new();
    let mut stolen = 0;
    while stolen < min_len {
        if !decoder.can_decode() {
            return Err(RelocateError::Undecodable);
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(RelocateError::Undecodable);
        }
        stolen += instruction.len();
        let returns = instruction.flow_control() == FlowControl::Return;
        instructions.push(instruction);
        if returns && stolen < min_len {
            // The body ends inside the patch site; nothing left to relocate
            return Err(RelocateError::TooSmall);
        }
    }

    let block = InstructionBlock::new(&instructions, dest_ip);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?;
    Ok((encoded.code_buffer, stolen))
}

#[cfg(test)]
mod tests {
    use super::{jmp_abs, jmp_indirect, rip_disp, steal_prologue, RelocateError, JMP_IND_SIZE};

    #[test]
    /// Absolute jumps encode as `jmp [rip]` followed by the raw address
    fn test_jmp_abs() {
        let code = jmp_abs(0x1122334455667788);
        assert_eq!(&code[..6], &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&code[6..], &0x1122334455667788usize.to_le_bytes());
    }

    #[test]
    /// Indirect jumps encode the displacement little-endian after the opcode
    fn test_jmp_indirect() {
        let code = jmp_indirect(0x10);
        assert_eq!(code, [0xff, 0x25, 0x10, 0x00, 0x00, 0x00]);

        let code = jmp_indirect(-2);
        assert_eq!(code, [0xff, 0x25, 0xfe, 0xff, 0xff, 0xff]);
    }

    #[test]
    /// Displacements outside 32 bits are rejected
    fn test_rip_disp_range() {
        assert_eq!(rip_disp(0x1000, 0x2000), Some(0x1000));
        assert_eq!(rip_disp(0x2000, 0x1000), Some(-0x1000));
        assert_eq!(rip_disp(0, usize::MAX / 2), None);
    }

    #[test]
    /// Whole instructions are consumed, never split mid-instruction
    fn test_steal_whole_instructions() {
        // mov rax, rdi; add rax, rsi; ret; padding
        let mut body = [0x90u8; 32];
        body[..7].copy_from_slice(&[0x48, 0x89, 0xf8, 0x48, 0x01, 0xf0, 0xc3]);

        let (code, stolen) =
            unsafe { steal_prologue(body.as_ptr(), JMP_IND_SIZE, 0x7000_0000).unwrap() };
        assert_eq!(stolen, 6);
        // Both instructions are position-independent, so they re-encode as-is
        assert_eq!(code, &body[..6]);
    }

    #[test]
    /// A body that returns inside the patch site cannot host a redirection
    fn test_steal_too_small() {
        // xor eax, eax; ret; padding
        let mut body = [0x90u8; 32];
        body[..3].copy_from_slice(&[0x31, 0xc0, 0xc3]);

        match unsafe { steal_prologue(body.as_ptr(), JMP_IND_SIZE, 0x7000_0000) } {
            Err(RelocateError::TooSmall) => {}
            other => panic!("expected TooSmall, got {other:?}"),
        }
    }
}

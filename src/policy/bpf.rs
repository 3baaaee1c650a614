//! Classic BPF building blocks for seccomp programs
//!
//! Instructions are `seccompiler::sock_filter` values so the program can be
//! handed straight to the installer. Conditional jumps only ever skip a
//! few instructions; anything further goes through a `ja` whose 32-bit
//! offset is resolved by `Assembler` once the program layout is known.

use seccompiler::sock_filter;

use super::ast::Verdict;

// BPF instruction classes. See /usr/include/linux/bpf_common.h .
pub const BPF_LD: u16 = 0x00;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;

// ld/ldx fields
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;

// jmp fields
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;
pub const BPF_K: u16 = 0x00;

/// Kernel limit on program length (`BPF_MAXINSNS`).
pub const BPF_MAX_LEN: usize = 4096;

// Return codes. See /usr/include/linux/seccomp.h .
pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_KILL_THREAD: u32 = 0x0000_0000;
pub const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_ACTION_FULL: u32 = 0xffff_0000;
pub const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

// `struct seccomp_data` layout:
//
// ```c
// struct seccomp_data {
//     int nr;
//     __u32 arch;
//     __u64 instruction_pointer;
//     __u64 args[6];
// };
// ```
pub const SECCOMP_DATA_NR_OFFSET: u32 = 0;
pub const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
pub const SECCOMP_DATA_ARGS_OFFSET: u32 = 16;
pub const SECCOMP_DATA_ARG_SIZE: u32 = 8;
pub const SECCOMP_DATA_LEN: usize = 64;

#[allow(non_snake_case)]
pub fn BPF_STMT(code: u16, k: u32) -> sock_filter {
    sock_filter { code, jt: 0, jf: 0, k }
}

#[allow(non_snake_case)]
pub fn BPF_JUMP(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// Load a 32-bit word of `seccomp_data` into the accumulator.
pub fn load(offset: u32) -> sock_filter {
    BPF_STMT(BPF_LD | BPF_W | BPF_ABS, offset)
}

/// Offsets of the (low, high) 32-bit halves of argument `index`.
/// All supported targets are little-endian.
pub fn arg_offsets(index: u8) -> (u32, u32) {
    let base = SECCOMP_DATA_ARGS_OFFSET + u32::from(index) * SECCOMP_DATA_ARG_SIZE;
    (base, base + 4)
}

/// Seccomp return value for a verdict.
pub fn ret_value(verdict: Verdict) -> u32 {
    match verdict {
        Verdict::Allow => SECCOMP_RET_ALLOW,
        Verdict::Deny(errno) => SECCOMP_RET_ERRNO | u32::from(errno),
        Verdict::Kill => SECCOMP_RET_KILL_PROCESS,
        Verdict::KillThread => SECCOMP_RET_KILL_THREAD,
        Verdict::Trap => SECCOMP_RET_TRAP,
        Verdict::Log => SECCOMP_RET_LOG,
    }
}

/// Inverse of `ret_value`. Unknown codes map to `None`.
pub fn verdict_of(ret: u32) -> Option<Verdict> {
    match ret & SECCOMP_RET_ACTION_FULL {
        SECCOMP_RET_ALLOW => Some(Verdict::Allow),
        SECCOMP_RET_ERRNO => Some(Verdict::Deny((ret & SECCOMP_RET_DATA) as u16)),
        SECCOMP_RET_KILL_PROCESS => Some(Verdict::Kill),
        SECCOMP_RET_KILL_THREAD => Some(Verdict::KillThread),
        SECCOMP_RET_TRAP => Some(Verdict::Trap),
        SECCOMP_RET_LOG => Some(Verdict::Log),
        _ => None,
    }
}

pub fn ret(verdict: Verdict) -> sock_filter {
    BPF_STMT(BPF_RET | BPF_K, ret_value(verdict))
}

// ─────────────────────────────────────────────────────────────────────────────
// Assembler
// ─────────────────────────────────────────────────────────────────────────────

/// A jump target whose position is fixed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

enum Slot {
    Insn(sock_filter),
    JumpTo(Label),
}

/// Appends instructions and resolves `ja` targets.
#[derive(Default)]
pub struct Assembler {
    slots: Vec<Slot>,
    labels: Vec<Option<usize>>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, insn: sock_filter) {
        self.slots.push(Slot::Insn(insn));
    }

    /// Unconditional jump to a label.
    pub fn jump(&mut self, label: Label) {
        self.slots.push(Slot::JumpTo(label));
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next instruction pushed.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.slots.len());
    }

    /// Resolve jumps. Fails if a label was never bound or points backwards.
    pub fn finish(self) -> Result<Vec<sock_filter>, String> {
        let labels = self.labels;
        self.slots
            .into_iter()
            .enumerate()
            .map(|(pc, slot)| match slot {
                Slot::Insn(insn) => Ok(insn),
                Slot::JumpTo(label) => {
                    let target = labels[label.0].ok_or_else(|| format!("unbound label {}", label.0))?;
                    if target <= pc {
                        return Err(format!("backward jump from {} to {}", pc, target));
                    }
                    Ok(BPF_STMT(BPF_JMP | BPF_JA, (target - pc - 1) as u32))
                }
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interpreter
// ─────────────────────────────────────────────────────────────────────────────

/// Build the `struct seccomp_data` the kernel would pass for a syscall.
pub fn seccomp_data(nr: i32, arch: u32, args: &[u64; 6]) -> [u8; SECCOMP_DATA_LEN] {
    let mut data = [0u8; SECCOMP_DATA_LEN];
    data[0..4].copy_from_slice(&nr.to_le_bytes());
    data[4..8].copy_from_slice(&arch.to_le_bytes());
    for (i, arg) in args.iter().enumerate() {
        let off = SECCOMP_DATA_ARGS_OFFSET as usize + i * SECCOMP_DATA_ARG_SIZE as usize;
        data[off..off + 8].copy_from_slice(&arg.to_le_bytes());
    }
    data
}

/// Run a program over `data` and return the seccomp return value.
///
/// Supports the instruction subset this crate emits; anything else is an
/// error rather than a guess.
pub fn run(program: &[sock_filter], data: &[u8; SECCOMP_DATA_LEN]) -> Result<u32, String> {
    let mut acc: u32 = 0;
    let mut pc: usize = 0;

    while let Some(insn) = program.get(pc) {
        let code = insn.code;
        match code {
            c if c == BPF_LD | BPF_W | BPF_ABS => {
                let off = insn.k as usize;
                let word = data
                    .get(off..off + 4)
                    .ok_or_else(|| format!("load out of bounds at {}", pc))?;
                acc = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                pc += 1;
            }
            c if c == BPF_RET | BPF_K => return Ok(insn.k),
            c if c == BPF_JMP | BPF_JA => {
                pc += 1 + insn.k as usize;
            }
            c if c & 0x07 == BPF_JMP && c & 0x08 == BPF_K => {
                let taken = match c & 0xf0 {
                    BPF_JEQ => acc == insn.k,
                    BPF_JGT => acc > insn.k,
                    BPF_JGE => acc >= insn.k,
                    BPF_JSET => acc & insn.k != 0,
                    _ => return Err(format!("unsupported jump {:#x} at {}", c, pc)),
                };
                pc += 1 + usize::from(if taken { insn.jt } else { insn.jf });
            }
            _ => return Err(format!("unsupported instruction {:#x} at {}", code, pc)),
        }
    }
    Err("program ran off the end".to_string())
}

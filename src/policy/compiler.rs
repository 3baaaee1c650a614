//! Resolved policy → seccomp BPF program
//!
//! ```text
//!   ld  [arch]                      ; wrong ABI → kill process
//!   jeq AUDIT_ARCH, 1, 0
//!   ret KILL_PROCESS
//!   ld  [nr]
//!   jeq nr_a, 0, 1 ; ret ALLOW      ; unconditional rules
//!   jeq nr_b, 0, 1 ; ja body_b      ; conditional rules
//!   ...
//!   ret DEFAULT
//! body_b:
//!   <clause 1 atoms, failure → clause 2> ; ret ALLOW
//!   <clause 2 atoms, failure → fallback> ; ret ALLOW
//!   ret FALLBACK
//! ```
//!
//! Syscalls are dispatched most frequent first, then by number. Each 64-bit
//! comparison is split into checks on the high and low 32-bit words.

use std::cmp::Reverse;

use seccompiler::{sock_filter, BpfProgram};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::arch::TargetArch;
use super::ast::{Action, Clause, CmpOp, Comparison, Verdict};
use super::bpf::{
    self, arg_offsets, load, ret, Assembler, Label, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_JSET,
    BPF_JUMP, BPF_K, BPF_MAX_LEN,
};
use super::predicate::{normalize, Normalized};
use super::resolver::ResolvedPolicy;
use crate::error::{PolicyError, Result};
use crate::metrics;

/// What the dispatch chain does for one syscall number.
enum Body {
    Return(Verdict),
    Conditional { clauses: Vec<Clause>, otherwise: Verdict },
}

struct Entry {
    nr: u32,
    frequency: u64,
    body: Body,
}

/// A compiled, not yet installed, seccomp filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledFilter {
    arch: TargetArch,
    default_action: Verdict,
    #[serde(skip)]
    program: BpfProgram,
    syscalls: usize,
}

impl CompiledFilter {
    pub fn arch(&self) -> TargetArch {
        self.arch
    }

    pub fn default_action(&self) -> Verdict {
        self.default_action
    }

    /// Number of syscalls with an explicit rule.
    pub fn syscalls(&self) -> usize {
        self.syscalls
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    pub fn instructions(&self) -> &[sock_filter] {
        &self.program
    }

    pub(crate) fn into_program(self) -> BpfProgram {
        self.program
    }

    /// Raw program image as the kernel reads it: 8 bytes per instruction,
    /// native endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.program.len() * 8);
        for insn in &self.program {
            out.extend_from_slice(&insn.code.to_ne_bytes());
            out.push(insn.jt);
            out.push(insn.jf);
            out.extend_from_slice(&insn.k.to_ne_bytes());
        }
        out
    }

    /// Run the program over a synthetic `seccomp_data` for syscall `nr`.
    pub fn evaluate(&self, nr: i32, args: &[u64; 6]) -> Result<Verdict> {
        self.evaluate_raw(nr, self.arch.audit_value(), args)
    }

    /// Like `evaluate`, with the syscall named.
    pub fn evaluate_syscall(&self, name: &str, args: &[u64; 6]) -> Result<Verdict> {
        let nr = self.arch.syscall_number(name).ok_or_else(|| {
            PolicyError::Config(format!("syscall '{}' is not known on {}", name, self.arch))
        })?;
        self.evaluate(nr as i32, args)
    }

    /// Evaluate with an explicit audit arch value.
    pub fn evaluate_raw(&self, nr: i32, audit_arch: u32, args: &[u64; 6]) -> Result<Verdict> {
        let data = bpf::seccomp_data(nr, audit_arch, args);
        let value = bpf::run(&self.program, &data).map_err(PolicyError::Compile)?;
        bpf::verdict_of(value)
            .ok_or_else(|| PolicyError::Compile(format!("unknown seccomp return value {:#x}", value)))
    }
}

/// Compiles resolved policies for one target architecture.
#[derive(Debug, Clone, Copy)]
pub struct FilterCompiler {
    arch: TargetArch,
}

impl FilterCompiler {
    pub fn new(arch: TargetArch) -> Self {
        Self { arch }
    }

    pub fn compile(&self, policy: &ResolvedPolicy) -> Result<CompiledFilter> {
        let mut entries = Vec::with_capacity(policy.rules.len());

        for (name, rule) in &policy.rules {
            let nr = self
                .arch
                .syscall_number(name)
                .ok_or_else(|| PolicyError::UnknownSyscall {
                    syscall: name.clone(),
                    arch: self.arch.to_string(),
                    location: rule.origin.clone(),
                })?;

            let body = match &rule.action {
                Action::AllowIf { predicate, otherwise } => {
                    let otherwise = otherwise.unwrap_or(policy.default_action);
                    match normalize(predicate, self.arch)? {
                        Normalized::Always => Body::Return(Verdict::Allow),
                        Normalized::Never => {
                            warn!(syscall = %name, origin = %rule.origin, "condition can never hold");
                            Body::Return(otherwise)
                        }
                        Normalized::Clauses(clauses) => Body::Conditional { clauses, otherwise },
                    }
                }
                action => Body::Return(action.unconditional().unwrap_or(policy.default_action)),
            };

            entries.push(Entry {
                nr: nr as u32,
                frequency: policy.frequencies.get(name).copied().unwrap_or(0),
                body,
            });
        }

        entries.sort_by_key(|e| (Reverse(e.frequency), e.nr));

        let program = self.emit(&entries, policy.default_action)?;
        if program.len() > BPF_MAX_LEN {
            return Err(PolicyError::Compile(format!(
                "program has {} instructions, the kernel limit is {}",
                program.len(),
                BPF_MAX_LEN
            )));
        }

        metrics::FILTER_INSTRUCTIONS.set(program.len() as i64);
        info!(
            arch = %self.arch,
            syscalls = entries.len(),
            instructions = program.len(),
            default_action = %policy.default_action,
            "compiled seccomp filter"
        );

        Ok(CompiledFilter {
            arch: self.arch,
            default_action: policy.default_action,
            program,
            syscalls: entries.len(),
        })
    }

    fn emit(&self, entries: &[Entry], default_action: Verdict) -> Result<BpfProgram> {
        let mut asm = Assembler::new();

        asm.push(load(bpf::SECCOMP_DATA_ARCH_OFFSET));
        asm.push(BPF_JUMP(BPF_JMP | BPF_JEQ | BPF_K, self.arch.audit_value(), 1, 0));
        asm.push(ret(Verdict::Kill));
        asm.push(load(bpf::SECCOMP_DATA_NR_OFFSET));

        let mut bodies: Vec<(Label, &[Clause], Verdict)> = Vec::new();
        for entry in entries {
            asm.push(BPF_JUMP(BPF_JMP | BPF_JEQ | BPF_K, entry.nr, 0, 1));
            match &entry.body {
                Body::Return(verdict) => asm.push(ret(*verdict)),
                Body::Conditional { clauses, otherwise } => {
                    let body = asm.label();
                    asm.jump(body);
                    bodies.push((body, clauses.as_slice(), *otherwise));
                }
            }
        }
        asm.push(ret(default_action));

        for (body, clauses, otherwise) in bodies {
            asm.bind(body);
            for clause in clauses {
                let next = asm.label();
                for cmp in &clause.comparisons {
                    emit_comparison(&mut asm, *cmp, next);
                }
                asm.push(ret(Verdict::Allow));
                asm.bind(next);
            }
            asm.push(ret(otherwise));
        }

        debug!(instructions = asm.len(), "assembled program");
        asm.finish().map_err(PolicyError::Compile)
    }
}

/// Falls through when the comparison holds, jumps to `fail` otherwise.
fn emit_comparison(asm: &mut Assembler, cmp: Comparison, fail: Label) {
    let (lo_off, hi_off) = arg_offsets(cmp.arg);
    let v = cmp.op.constant();
    let (hi, lo) = ((v >> 32) as u32, v as u32);
    let jeq = BPF_JMP | BPF_JEQ | BPF_K;
    let jgt = BPF_JMP | BPF_JGT | BPF_K;
    let jge = BPF_JMP | BPF_JGE | BPF_K;
    let jset = BPF_JMP | BPF_JSET | BPF_K;

    asm.push(load(hi_off));
    match cmp.op {
        CmpOp::Eq(_) => {
            asm.push(BPF_JUMP(jeq, hi, 1, 0));
            asm.jump(fail);
            asm.push(load(lo_off));
            asm.push(BPF_JUMP(jeq, lo, 1, 0));
            asm.jump(fail);
        }
        CmpOp::Ne(_) => {
            asm.push(BPF_JUMP(jeq, hi, 0, 3));
            asm.push(load(lo_off));
            asm.push(BPF_JUMP(jeq, lo, 0, 1));
            asm.jump(fail);
        }
        CmpOp::Gt(_) | CmpOp::Ge(_) => {
            let low_cmp = if matches!(cmp.op, CmpOp::Gt(_)) { jgt } else { jge };
            asm.push(BPF_JUMP(jgt, hi, 4, 0));
            asm.push(BPF_JUMP(jeq, hi, 0, 2));
            asm.push(load(lo_off));
            asm.push(BPF_JUMP(low_cmp, lo, 1, 0));
            asm.jump(fail);
        }
        CmpOp::Lt(_) => {
            asm.push(BPF_JUMP(jge, hi, 0, 4));
            asm.push(BPF_JUMP(jeq, hi, 0, 2));
            asm.push(load(lo_off));
            asm.push(BPF_JUMP(jge, lo, 0, 1));
            asm.jump(fail);
        }
        CmpOp::Le(_) => {
            asm.push(BPF_JUMP(jgt, hi, 3, 0));
            asm.push(BPF_JUMP(jeq, hi, 0, 3));
            asm.push(load(lo_off));
            asm.push(BPF_JUMP(jgt, lo, 0, 1));
            asm.jump(fail);
        }
        CmpOp::MaskedNonZero(_) => {
            asm.push(BPF_JUMP(jset, hi, 3, 0));
            asm.push(load(lo_off));
            asm.push(BPF_JUMP(jset, lo, 1, 0));
            asm.jump(fail);
        }
        CmpOp::In(_) => {
            asm.push(BPF_JUMP(jset, !hi, 0, 1));
            asm.jump(fail);
            asm.push(load(lo_off));
            asm.push(BPF_JUMP(jset, !lo, 0, 1));
            asm.jump(fail);
        }
    }
}

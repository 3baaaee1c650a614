//! Policy syntax tree
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  ioctl: arg1 == FIONREAD || arg1 & 0x40 && arg0 < 3; return ENOTTY │
//! │  ─────  ──────────────────   ────────────────────   ────────────── │
//! │  name        Clause                 Clause            otherwise    │
//! │              └──────── Predicate (OR of clauses) ──┘               │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Constants are already resolved to integers by the time they land in the
//! tree; symbol names only exist in the source text.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Location, PolicyError};

/// Largest errno a seccomp return value can carry (`SECCOMP_RET_DATA`).
pub const MAX_ERRNO: u64 = 0xffff;

/// Terminal outcome of a filter decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Verdict {
    Allow,
    /// Fail the syscall with this errno.
    Deny(u16),
    /// Kill the whole process.
    Kill,
    KillThread,
    /// Deliver SIGSYS.
    Trap,
    /// Allow, but have the kernel audit-log the call.
    Log,
}

impl Verdict {
    pub fn is_allow(self) -> bool {
        matches!(self, Verdict::Allow)
    }

    /// True when the kernel lets the syscall run: `allow`, and `log`
    /// (audited, then allowed). Defaults and fallbacks must not permit.
    pub fn permits(self) -> bool {
        matches!(self, Verdict::Allow | Verdict::Log)
    }

    /// Parse the keyword form used after `:`, after `;` and by `@default`.
    /// Symbolic errnos go through `lookup`.
    pub fn parse_with<F>(text: &str, lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<u64>,
    {
        let text = text.trim();
        if let Some(rest) = text.strip_prefix("return") {
            let errno_text = rest.trim();
            if errno_text.is_empty() || !rest.starts_with(char::is_whitespace) {
                return Err(format!("malformed action '{}'", text));
            }
            let errno = match parse_number(errno_text) {
                Some(n) => n,
                None => lookup(errno_text)
                    .ok_or_else(|| format!("unresolved symbol '{}'", errno_text))?,
            };
            if errno > MAX_ERRNO {
                return Err(format!("errno {} out of range", errno));
            }
            return Ok(Verdict::Deny(errno as u16));
        }
        match text {
            "1" | "allow" => Ok(Verdict::Allow),
            "kill" | "kill-process" => Ok(Verdict::Kill),
            "kill-thread" => Ok(Verdict::KillThread),
            "trap" => Ok(Verdict::Trap),
            "log" => Ok(Verdict::Log),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => f.write_str("allow"),
            Verdict::Deny(errno) => write!(f, "return {}", errno),
            Verdict::Kill => f.write_str("kill"),
            Verdict::KillThread => f.write_str("kill-thread"),
            Verdict::Trap => f.write_str("trap"),
            Verdict::Log => f.write_str("log"),
        }
    }
}

impl FromStr for Verdict {
    type Err = PolicyError;

    /// Numeric errnos only; symbolic ones need a symbol table.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verdict::parse_with(s, |_| None).map_err(PolicyError::Config)
    }
}

impl TryFrom<String> for Verdict {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Verdict> for String {
    fn from(verdict: Verdict) -> Self {
        verdict.to_string()
    }
}

/// Integer literal in policy syntax: decimal, `0x` hex, or leading-zero octal.
pub(crate) fn parse_number(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if text.len() > 1 && text.starts_with('0') {
        u64::from_str_radix(&text[1..], 8).ok()
    } else {
        text.parse::<u64>().ok()
    }
}

/// Comparison applied to one syscall argument. All comparisons are unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
pub enum CmpOp {
    Eq(u64),
    Ne(u64),
    Lt(u64),
    Le(u64),
    Gt(u64),
    Ge(u64),
    /// `arg & mask != 0`
    MaskedNonZero(u64),
    /// `arg & !mask == 0`: only bits from the mask may be set.
    In(u64),
}

impl CmpOp {
    pub fn constant(self) -> u64 {
        match self {
            CmpOp::Eq(v)
            | CmpOp::Ne(v)
            | CmpOp::Lt(v)
            | CmpOp::Le(v)
            | CmpOp::Gt(v)
            | CmpOp::Ge(v)
            | CmpOp::MaskedNonZero(v)
            | CmpOp::In(v) => v,
        }
    }

    pub fn with_constant(self, v: u64) -> Self {
        match self {
            CmpOp::Eq(_) => CmpOp::Eq(v),
            CmpOp::Ne(_) => CmpOp::Ne(v),
            CmpOp::Lt(_) => CmpOp::Lt(v),
            CmpOp::Le(_) => CmpOp::Le(v),
            CmpOp::Gt(_) => CmpOp::Gt(v),
            CmpOp::Ge(_) => CmpOp::Ge(v),
            CmpOp::MaskedNonZero(_) => CmpOp::MaskedNonZero(v),
            CmpOp::In(_) => CmpOp::In(v),
        }
    }

    pub fn holds(self, value: u64) -> bool {
        match self {
            CmpOp::Eq(v) => value == v,
            CmpOp::Ne(v) => value != v,
            CmpOp::Lt(v) => value < v,
            CmpOp::Le(v) => value <= v,
            CmpOp::Gt(v) => value > v,
            CmpOp::Ge(v) => value >= v,
            CmpOp::MaskedNonZero(mask) => value & mask != 0,
            CmpOp::In(mask) => value & !mask == 0,
        }
    }
}

/// `argN <op> constant`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Comparison {
    pub arg: u8,
    pub op: CmpOp,
}

impl Comparison {
    pub fn new(arg: u8, op: CmpOp) -> Self {
        Self { arg, op }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (op, v) = match self.op {
            CmpOp::Eq(v) => ("==", v),
            CmpOp::Ne(v) => ("!=", v),
            CmpOp::Lt(v) => ("<", v),
            CmpOp::Le(v) => ("<=", v),
            CmpOp::Gt(v) => (">", v),
            CmpOp::Ge(v) => (">=", v),
            CmpOp::MaskedNonZero(v) => ("&", v),
            CmpOp::In(v) => ("in", v),
        };
        write!(f, "arg{} {} {:#x}", self.arg, op, v)
    }
}

/// Conjunction of comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Clause {
    pub comparisons: Vec<Comparison>,
}

impl Clause {
    pub fn new(comparisons: Vec<Comparison>) -> Self {
        Self { comparisons }
    }
}

/// Disjunction of clauses: the syscall is allowed if any clause holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Predicate {
    pub clauses: Vec<Clause>,
}

impl Predicate {
    pub fn new(clauses: Vec<Clause>) -> Self {
        Self { clauses }
    }

    /// Single `argN == value` clause.
    pub fn arg_eq(arg: u8, value: u64) -> Self {
        Self::new(vec![Clause::new(vec![Comparison::new(arg, CmpOp::Eq(value))])])
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" || ")?;
            }
            for (j, cmp) in clause.comparisons.iter().enumerate() {
                if j > 0 {
                    f.write_str(" && ")?;
                }
                write!(f, "{}", cmp)?;
            }
        }
        Ok(())
    }
}

/// What a rule does with its syscall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Action {
    Allow,
    /// Allow when the predicate holds; otherwise apply `otherwise`, or the
    /// policy default when none was given.
    AllowIf {
        predicate: Predicate,
        otherwise: Option<Verdict>,
    },
    Deny { errno: u16 },
    Kill,
    KillThread,
    Trap,
    Log,
}

impl Action {
    /// The verdict of an unconditional action.
    pub fn unconditional(&self) -> Option<Verdict> {
        match self {
            Action::Allow => Some(Verdict::Allow),
            Action::AllowIf { .. } => None,
            Action::Deny { errno } => Some(Verdict::Deny(*errno)),
            Action::Kill => Some(Verdict::Kill),
            Action::KillThread => Some(Verdict::KillThread),
            Action::Trap => Some(Verdict::Trap),
            Action::Log => Some(Verdict::Log),
        }
    }

    /// Short label used for metrics and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::AllowIf { .. } => "allow_if",
            Action::Deny { .. } => "deny",
            Action::Kill => "kill",
            Action::KillThread => "kill_thread",
            Action::Trap => "trap",
            Action::Log => "log",
        }
    }
}

impl From<Verdict> for Action {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Allow => Action::Allow,
            Verdict::Deny(errno) => Action::Deny { errno },
            Verdict::Kill => Action::Kill,
            Verdict::KillThread => Action::KillThread,
            Verdict::Trap => Action::Trap,
            Verdict::Log => Action::Log,
        }
    }
}

/// `syscall: action` with the place it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub syscall: String,
    pub action: Action,
    pub location: Location,
}

/// An `@include` or `@frequency` reference, not yet loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: String,
    pub location: Location,
}

/// One parsed policy file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDocument {
    pub path: PathBuf,
    /// One rule per syscall, in order of first appearance.
    pub rules: Vec<Rule>,
    pub includes: Vec<FileRef>,
    pub frequency_files: Vec<FileRef>,
    pub default_action: Option<(Verdict, Location)>,
}

impl PolicyDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rules: Vec::new(),
            includes: Vec::new(),
            frequency_files: Vec::new(),
            default_action: None,
        }
    }

    pub fn rule(&self, syscall: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.syscall == syscall)
    }
}

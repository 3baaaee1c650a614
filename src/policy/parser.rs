//! Policy file parser
//!
//! Line-oriented grammar, one statement per logical line:
//!
//! ```text
//! # comment
//! @include base.policy
//! @frequency device.frequency
//! @default return EPERM
//! read: 1
//! open: return ENOENT
//! ioctl: arg1 == FIONREAD || arg1 == TCGETS; return ENOTTY
//! mmap: arg2 in PROT_READ|PROT_WRITE && \
//!       arg3 & MAP_ANONYMOUS
//! ```
//!
//! A physical line ending in `\` continues on the next line. Symbol names
//! resolve through the caller's `SymbolTable` while parsing, so an unknown
//! name fails here rather than at compile time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::ast::{
    parse_number, Action, Clause, CmpOp, Comparison, FileRef, PolicyDocument, Predicate, Rule,
    Verdict,
};
use super::symbols::SymbolTable;
use crate::error::{Location, PolicyError, Result};

/// Parse one policy file.
pub fn parse_policy(path: impl AsRef<Path>, text: &str, symbols: &SymbolTable) -> Result<PolicyDocument> {
    PolicyParser::new(path.as_ref(), symbols).parse(text)
}

/// Parse a frequency file: `syscall: count` per line.
pub fn parse_frequency(path: impl AsRef<Path>, text: &str) -> Result<Vec<(String, u64)>> {
    let path = path.as_ref();
    let mut counts = Vec::new();
    for line in logical_lines(text) {
        let body = line.text.trim();
        if body.is_empty() {
            continue;
        }
        let (name, count) = body.split_once(':').ok_or_else(|| {
            PolicyError::parse(path, line.number, 1, "expected 'syscall: count'")
        })?;
        let name = name.trim();
        if !is_syscall_name(name) {
            return Err(PolicyError::parse(
                path,
                line.number,
                1,
                format!("invalid syscall name '{}'", name),
            ));
        }
        let count = parse_number(count.trim()).ok_or_else(|| {
            PolicyError::parse(
                path,
                line.number,
                line.text.find(':').map_or(1, |i| i + 2),
                format!("invalid count '{}'", count.trim()),
            )
        })?;
        counts.push((name.to_string(), count));
    }
    Ok(counts)
}

/// One statement after comment stripping and continuation joining.
struct LogicalLine {
    /// First physical line of the statement (1-based).
    number: usize,
    text: String,
    /// Where each joined physical line starts in `text`.
    segments: Vec<Segment>,
}

struct Segment {
    offset: usize,
    line: usize,
    /// 1-based physical column of `text[offset]`.
    column: usize,
}

impl LogicalLine {
    /// Physical (line, column) of a 1-based column in the joined text.
    fn position(&self, column: usize) -> (usize, usize) {
        let offset = column.saturating_sub(1);
        match self.segments.iter().rev().find(|seg| seg.offset <= offset) {
            Some(seg) => (seg.line, seg.column + offset - seg.offset),
            None => (self.number, column),
        }
    }

    /// Point a parse error raised against this statement at the physical
    /// line that holds the offending text.
    fn relocate(&self, err: PolicyError) -> PolicyError {
        match err {
            PolicyError::Parse { file, line, column, reason } if line == self.number => {
                let (line, column) = self.position(column);
                PolicyError::Parse { file, line, column, reason }
            }
            other => other,
        }
    }
}

fn logical_lines(text: &str) -> Vec<LogicalLine> {
    let mut out = Vec::new();
    let mut pending: Option<LogicalLine> = None;

    for (idx, raw) in text.lines().enumerate() {
        let stripped = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let trimmed_end = stripped.trim_end();
        let (content, continues) = match trimmed_end.strip_suffix('\\') {
            Some(head) => (head, true),
            None => (trimmed_end, false),
        };

        let line = match pending.take() {
            Some(mut prev) => {
                let body = content.trim_start();
                prev.text.push(' ');
                prev.segments.push(Segment {
                    offset: prev.text.len(),
                    line: idx + 1,
                    column: content.len() - body.len() + 1,
                });
                prev.text.push_str(body);
                prev
            }
            None => LogicalLine {
                number: idx + 1,
                text: content.to_string(),
                segments: vec![Segment {
                    offset: 0,
                    line: idx + 1,
                    column: 1,
                }],
            },
        };

        if continues {
            pending = Some(line);
        } else {
            out.push(line);
        }
    }
    if let Some(line) = pending {
        out.push(line);
    }
    out
}

fn is_syscall_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct PolicyParser<'a> {
    path: PathBuf,
    symbols: &'a SymbolTable,
}

impl<'a> PolicyParser<'a> {
    fn new(path: &Path, symbols: &'a SymbolTable) -> Self {
        Self {
            path: path.to_path_buf(),
            symbols,
        }
    }

    fn parse(&self, text: &str) -> Result<PolicyDocument> {
        let mut doc = PolicyDocument::new(&self.path);
        let mut index: HashMap<String, usize> = HashMap::new();

        for line in logical_lines(text) {
            let body = line.text.trim();
            if body.is_empty() {
                continue;
            }
            let indent = line.text.len() - line.text.trim_start().len();

            if let Some(directive) = body.strip_prefix('@') {
                self.parse_directive(&mut doc, directive, line.number, indent)
                    .map_err(|e| line.relocate(e))?;
                continue;
            }

            let rule = self
                .parse_rule(&line.text, line.number)
                .map_err(|e| line.relocate(e))?;
            match index.get(&rule.syscall) {
                Some(&i) => merge_repeat(&mut doc.rules[i], rule)?,
                None => {
                    index.insert(rule.syscall.clone(), doc.rules.len());
                    doc.rules.push(rule);
                }
            }
        }

        debug!(
            file = %self.path.display(),
            rules = doc.rules.len(),
            includes = doc.includes.len(),
            "parsed policy file"
        );
        Ok(doc)
    }

    fn location(&self, line: usize) -> Location {
        Location::new(&self.path, line)
    }

    fn parse_directive(
        &self,
        doc: &mut PolicyDocument,
        directive: &str,
        line: usize,
        indent: usize,
    ) -> Result<()> {
        let (word, arg) = match directive.split_once(char::is_whitespace) {
            Some((w, a)) => (w, a.trim()),
            None => (directive, ""),
        };
        let arg_column = indent + 2 + word.len() + 1;

        match word {
            "include" | "frequency" => {
                if arg.is_empty() || arg.contains(char::is_whitespace) {
                    return Err(PolicyError::parse(
                        &self.path,
                        line,
                        arg_column,
                        format!("@{} expects exactly one path", word),
                    ));
                }
                let file_ref = FileRef {
                    path: arg.to_string(),
                    location: self.location(line),
                };
                if word == "include" {
                    doc.includes.push(file_ref);
                } else {
                    doc.frequency_files.push(file_ref);
                }
            }
            "default" => {
                let verdict = self.parse_verdict(arg, line, arg_column)?;
                if verdict.permits() {
                    return Err(PolicyError::parse(
                        &self.path,
                        line,
                        arg_column,
                        format!("default action '{}' lets the call through", verdict),
                    ));
                }
                match &doc.default_action {
                    Some((existing, at)) if *existing != verdict => {
                        return Err(PolicyError::ConflictingDefault {
                            first_action: existing.to_string(),
                            first: at.clone(),
                            second_action: verdict.to_string(),
                            second: self.location(line),
                        });
                    }
                    Some(_) => {}
                    None => doc.default_action = Some((verdict, self.location(line))),
                }
            }
            other => {
                return Err(PolicyError::parse(
                    &self.path,
                    line,
                    indent + 1,
                    format!("unknown directive '@{}'", other),
                ));
            }
        }
        Ok(())
    }

    fn parse_verdict(&self, text: &str, line: usize, column: usize) -> Result<Verdict> {
        Verdict::parse_with(text, |name| self.symbols.get(name)).map_err(|reason| {
            match reason.strip_prefix("unresolved symbol ") {
                Some(sym) => PolicyError::UnresolvedSymbol {
                    symbol: sym.trim_matches('\'').to_string(),
                    location: self.location(line),
                },
                None => PolicyError::parse(&self.path, line, column, reason),
            }
        })
    }

    fn parse_rule(&self, text: &str, line: usize) -> Result<Rule> {
        let colon = text.find(':').ok_or_else(|| {
            let column = text.len() - text.trim_start().len() + 1;
            PolicyError::parse(&self.path, line, column, "expected '<syscall>: <action>'")
        })?;
        let name = text[..colon].trim();
        if !is_syscall_name(name) {
            let column = text.len() - text.trim_start().len() + 1;
            return Err(PolicyError::parse(
                &self.path,
                line,
                column,
                format!("invalid syscall name '{}'", name),
            ));
        }

        let rhs_start = colon + 1;
        let rhs = &text[rhs_start..];
        let (expr, otherwise) = match rhs.find(';') {
            Some(semi) => (&rhs[..semi], Some((&rhs[semi + 1..], rhs_start + semi + 1))),
            None => (rhs, None),
        };
        let expr_column = rhs_start + (expr.len() - expr.trim_start().len()) + 1;
        let expr_trimmed = expr.trim();
        if expr_trimmed.is_empty() {
            return Err(PolicyError::parse(&self.path, line, expr_column, "missing action"));
        }

        let action = if starts_with_arg(expr_trimmed) {
            let predicate = ExprParser::new(self, expr, rhs_start, line)?.parse_predicate()?;
            let otherwise = match otherwise {
                Some((text, offset)) => {
                    let column = offset + (text.len() - text.trim_start().len()) + 1;
                    let verdict = self.parse_verdict(text, line, column)?;
                    if verdict.permits() {
                        return Err(PolicyError::parse(
                            &self.path,
                            line,
                            column,
                            format!("fallback '{}' lets the call through", verdict),
                        ));
                    }
                    Some(verdict)
                }
                None => None,
            };
            Action::AllowIf { predicate, otherwise }
        } else {
            if let Some((_, offset)) = otherwise {
                return Err(PolicyError::parse(
                    &self.path,
                    line,
                    offset,
                    "a fallback action is only allowed after a condition",
                ));
            }
            self.parse_verdict(expr_trimmed, line, expr_column)?.into()
        };

        Ok(Rule {
            syscall: name.to_string(),
            action,
            location: self.location(line),
        })
    }
}

fn starts_with_arg(expr: &str) -> bool {
    expr.strip_prefix("arg")
        .and_then(|rest| rest.chars().next())
        .map_or(false, |c| c.is_ascii_digit())
}

/// Same-file repeats of a syscall: conditions with the same fallback (or
/// none on both) are OR'd together, identical unconditional actions
/// collapse, anything else conflicts.
fn merge_repeat(existing: &mut Rule, repeat: Rule) -> Result<()> {
    let conflict = PolicyError::DuplicateSyscall {
        syscall: repeat.syscall.clone(),
        first: existing.location.clone(),
        second: repeat.location.clone(),
    };

    match (&mut existing.action, repeat.action) {
        (
            Action::AllowIf { predicate, otherwise },
            Action::AllowIf {
                predicate: more,
                otherwise: more_otherwise,
            },
        ) => {
            if *otherwise != more_otherwise {
                return Err(conflict);
            }
            predicate.clauses.extend(more.clauses);
            Ok(())
        }
        (a, b) if *a == b => Ok(()),
        _ => Err(conflict),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Expression tokenizer and recursive-descent parser
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Arg(u8),
    Ident(String),
    Number(u64),
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Amp,
    AndAnd,
    Pipe,
    OrOr,
    Tilde,
    Minus,
    LParen,
    RParen,
}

struct ExprParser<'p, 'a> {
    owner: &'p PolicyParser<'a>,
    line: usize,
    /// (token, 1-based column)
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    end_column: usize,
}

impl<'p, 'a> ExprParser<'p, 'a> {
    fn new(owner: &'p PolicyParser<'a>, expr: &str, base: usize, line: usize) -> Result<Self> {
        let tokens = tokenize(expr, base).map_err(|(column, reason)| {
            PolicyError::parse(&owner.path, line, column, reason)
        })?;
        Ok(Self {
            owner,
            line,
            tokens,
            pos: 0,
            end_column: base + expr.trim_end().len() + 1,
        })
    }

    fn error(&self, column: usize, reason: impl Into<String>) -> PolicyError {
        PolicyError::parse(&self.owner.path, self.line, column, reason)
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn column(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.end_column, |&(_, c)| c)
    }

    fn next(&mut self) -> Option<(Tok, usize)> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_predicate(mut self) -> Result<Predicate> {
        let mut clauses = vec![self.parse_clause()?];
        while self.eat(&Tok::OrOr) {
            clauses.push(self.parse_clause()?);
        }
        if let Some((tok, column)) = self.next() {
            return Err(self.error(column, format!("unexpected {:?}", tok)));
        }
        Ok(Predicate::new(clauses))
    }

    fn parse_clause(&mut self) -> Result<Clause> {
        let mut comparisons = vec![self.parse_atom()?];
        while self.eat(&Tok::AndAnd) {
            comparisons.push(self.parse_atom()?);
        }
        Ok(Clause::new(comparisons))
    }

    fn parse_atom(&mut self) -> Result<Comparison> {
        let column = self.column();
        let arg = match self.next() {
            Some((Tok::Arg(n), _)) => n,
            _ => return Err(self.error(column, "expected argN")),
        };

        let op_column = self.column();
        let op = match self.next() {
            Some((Tok::EqEq, _)) => CmpOp::Eq(self.parse_value()?),
            Some((Tok::NotEq, _)) => CmpOp::Ne(self.parse_value()?),
            Some((Tok::Lt, _)) => CmpOp::Lt(self.parse_value()?),
            Some((Tok::Le, _)) => CmpOp::Le(self.parse_value()?),
            Some((Tok::Gt, _)) => CmpOp::Gt(self.parse_value()?),
            Some((Tok::Ge, _)) => CmpOp::Ge(self.parse_value()?),
            Some((Tok::Ident(kw), _)) if kw == "in" => CmpOp::In(self.parse_value()?),
            Some((Tok::Amp, _)) => {
                let mask = self.parse_value()?;
                // optional explicit `!= 0`
                if self.eat(&Tok::NotEq) {
                    let zero_column = self.column();
                    match self.next() {
                        Some((Tok::Number(0), _)) => {}
                        _ => return Err(self.error(zero_column, "expected '0' after '& mask !='")),
                    }
                }
                CmpOp::MaskedNonZero(mask)
            }
            _ => return Err(self.error(op_column, "expected comparison operator")),
        };
        Ok(Comparison::new(arg, op))
    }

    /// `term ('|' term)*`
    fn parse_value(&mut self) -> Result<u64> {
        let mut value = self.parse_term()?;
        while self.eat(&Tok::Pipe) {
            value |= self.parse_term()?;
        }
        Ok(value)
    }

    fn parse_term(&mut self) -> Result<u64> {
        let column = self.column();
        match self.next() {
            Some((Tok::Tilde, _)) => Ok(!self.parse_term()?),
            Some((Tok::Minus, _)) => {
                let num_column = self.column();
                match self.next() {
                    Some((Tok::Number(n), _)) if n <= 1 << 63 => Ok((n as i64).wrapping_neg() as u64),
                    _ => Err(self.error(num_column, "expected number after '-'")),
                }
            }
            Some((Tok::LParen, _)) => {
                let value = self.parse_value()?;
                let close = self.column();
                if !self.eat(&Tok::RParen) {
                    return Err(self.error(close, "expected ')'"));
                }
                Ok(value)
            }
            Some((Tok::Number(n), _)) => Ok(n),
            Some((Tok::Ident(name), _)) => {
                self.owner
                    .symbols
                    .get(&name)
                    .ok_or_else(|| PolicyError::UnresolvedSymbol {
                        symbol: name,
                        location: self.owner.location(self.line),
                    })
            }
            _ => Err(self.error(column, "expected constant")),
        }
    }
}

/// Split an expression into tokens. `base` is the byte offset of `expr`
/// within its logical line, so reported columns point at the source.
fn tokenize(expr: &str, base: usize) -> std::result::Result<Vec<(Tok, usize)>, (usize, String)> {
    let bytes = expr.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let column = base + i + 1;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let two = bytes.get(i + 1).copied();
        let (tok, len) = match (c, two) {
            (b'=', Some(b'=')) => (Tok::EqEq, 2),
            (b'!', Some(b'=')) => (Tok::NotEq, 2),
            (b'<', Some(b'=')) => (Tok::Le, 2),
            (b'>', Some(b'=')) => (Tok::Ge, 2),
            (b'&', Some(b'&')) => (Tok::AndAnd, 2),
            (b'|', Some(b'|')) => (Tok::OrOr, 2),
            (b'<', _) => (Tok::Lt, 1),
            (b'>', _) => (Tok::Gt, 1),
            (b'&', _) => (Tok::Amp, 1),
            (b'|', _) => (Tok::Pipe, 1),
            (b'~', _) => (Tok::Tilde, 1),
            (b'-', _) => (Tok::Minus, 1),
            (b'(', _) => (Tok::LParen, 1),
            (b')', _) => (Tok::RParen, 1),
            (c, _) if c.is_ascii_digit() => {
                let end = scan(bytes, i, |b| b.is_ascii_alphanumeric());
                let text = &expr[i..end];
                let n = parse_number(text).ok_or((column, format!("invalid number '{}'", text)))?;
                (Tok::Number(n), end - i)
            }
            (c, _) if c.is_ascii_alphabetic() || c == b'_' => {
                let end = scan(bytes, i, |b| b.is_ascii_alphanumeric() || b == b'_');
                let text = &expr[i..end];
                let tok = match text.strip_prefix("arg") {
                    Some(n) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => {
                        let idx = n
                            .parse::<u8>()
                            .map_err(|_| (column, format!("invalid argument '{}'", text)))?;
                        Tok::Arg(idx)
                    }
                    _ => Tok::Ident(text.to_string()),
                };
                (tok, end - i)
            }
            _ => {
                let ch = expr[i..].chars().next().unwrap_or('?');
                return Err((column, format!("unexpected character '{}'", ch)));
            }
        };
        tokens.push((tok, column));
        i += len;
    }
    Ok(tokens)
}

fn scan(bytes: &[u8], start: usize, keep: impl Fn(u8) -> bool) -> usize {
    let mut end = start;
    while end < bytes.len() && keep(bytes[end]) {
        end += 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> SymbolTable {
        let mut t = SymbolTable::new();
        t.extend([
            ("ENOENT", 2),
            ("ENOTTY", 25),
            ("EPERM", 1),
            ("FIONREAD", 0x541b),
            ("O_RDONLY", 0),
            ("O_CLOEXEC", 0o2000000),
            ("PROT_READ", 1),
            ("PROT_WRITE", 2),
        ]);
        t
    }

    fn parse(text: &str) -> Result<PolicyDocument> {
        parse_policy("test.policy", text, &symbols())
    }

    fn action(doc: &PolicyDocument, name: &str) -> Action {
        doc.rule(name).expect("rule missing").action.clone()
    }

    #[test]
    fn test_allow_rule() {
        let doc = parse("foo: 1\n").unwrap();
        assert_eq!(action(&doc, "foo"), Action::Allow);
        assert_eq!(doc.rules[0].location.line, 1);
    }

    #[test]
    fn test_single_clause() {
        let doc = parse("foo: arg0 == 5").unwrap();
        assert_eq!(
            action(&doc, "foo"),
            Action::AllowIf {
                predicate: Predicate::arg_eq(0, 5),
                otherwise: None
            }
        );
    }

    #[test]
    fn test_or_clauses() {
        let doc = parse("foo: arg0 == 5 || arg0 == 6").unwrap();
        match action(&doc, "foo") {
            Action::AllowIf { predicate, .. } => {
                assert_eq!(predicate.clauses.len(), 2);
                assert_eq!(predicate.clauses[1].comparisons[0].op, CmpOp::Eq(6));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_action_keywords() {
        let doc = parse(
            "open: return ENOENT\nptrace: kill\nexecve: trap\nkexec_load: kill-thread\nuname: log\nbrk: return 12\n",
        )
        .unwrap();
        assert_eq!(action(&doc, "open"), Action::Deny { errno: 2 });
        assert_eq!(action(&doc, "ptrace"), Action::Kill);
        assert_eq!(action(&doc, "execve"), Action::Trap);
        assert_eq!(action(&doc, "kexec_load"), Action::KillThread);
        assert_eq!(action(&doc, "uname"), Action::Log);
        assert_eq!(action(&doc, "brk"), Action::Deny { errno: 12 });
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let doc = parse("# header\n\n   # indented\nread: 1 # trailing\n").unwrap();
        assert_eq!(doc.rules.len(), 1);
        assert_eq!(doc.rules[0].location.line, 4);
    }

    #[test]
    fn test_directives() {
        let doc = parse("@include common/base.policy\n@frequency dev.frequency\n@default return EPERM\n").unwrap();
        assert_eq!(doc.includes[0].path, "common/base.policy");
        assert_eq!(doc.frequency_files[0].path, "dev.frequency");
        assert_eq!(doc.default_action.as_ref().unwrap().0, Verdict::Deny(1));
    }

    #[test]
    fn test_default_must_not_allow() {
        let err = parse("@default 1").unwrap_err();
        assert!(matches!(err, PolicyError::Parse { line: 1, .. }), "{}", err);

        let err = parse("read: 1\n@default log\n").unwrap_err();
        assert!(matches!(err, PolicyError::Parse { line: 2, column: 10, .. }), "{}", err);
    }

    #[test]
    fn test_log_fallback_rejected() {
        let err = parse("ioctl: arg0 == 1; log\n").unwrap_err();
        assert!(matches!(err, PolicyError::Parse { line: 1, .. }), "{}", err);
        assert!(err.to_string().contains("lets the call through"));

        // log as a rule's own action is fine
        assert_eq!(action(&parse("uname: log\n").unwrap(), "uname"), Action::Log);
    }

    #[test]
    fn test_conflicting_default_in_one_file() {
        let err = parse("@default kill\n@default trap\n").unwrap_err();
        assert!(matches!(err, PolicyError::ConflictingDefault { .. }));
        assert!(parse("@default kill\n@default kill-process\n").is_ok());
    }

    #[test]
    fn test_unknown_directive() {
        let err = parse("@import x.policy").unwrap_err();
        assert!(err.to_string().contains("unknown directive"));
    }

    #[test]
    fn test_symbols_and_operators() {
        let doc = parse(
            "ioctl: arg1 == FIONREAD; return ENOTTY\n\
             openat: arg2 in O_RDONLY|O_CLOEXEC\n\
             mmap: arg2 & PROT_WRITE != 0 && arg0 != 0\n\
             lseek: arg2 <= 2 || arg2 > 0x10 || arg1 >= 4 || arg1 < 010\n\
             fcntl: arg0 == -1 || arg1 == ~(PROT_READ|PROT_WRITE)\n",
        )
        .unwrap();

        assert_eq!(
            action(&doc, "ioctl"),
            Action::AllowIf {
                predicate: Predicate::arg_eq(1, 0x541b),
                otherwise: Some(Verdict::Deny(25)),
            }
        );
        match action(&doc, "openat") {
            Action::AllowIf { predicate, .. } => {
                assert_eq!(predicate.clauses[0].comparisons[0].op, CmpOp::In(0o2000000));
            }
            other => panic!("{:?}", other),
        }
        match action(&doc, "mmap") {
            Action::AllowIf { predicate, .. } => {
                let cmps = &predicate.clauses[0].comparisons;
                assert_eq!(cmps[0], Comparison::new(2, CmpOp::MaskedNonZero(2)));
                assert_eq!(cmps[1], Comparison::new(0, CmpOp::Ne(0)));
            }
            other => panic!("{:?}", other),
        }
        match action(&doc, "lseek") {
            Action::AllowIf { predicate, .. } => {
                let ops: Vec<_> = predicate.clauses.iter().map(|c| c.comparisons[0].op).collect();
                assert_eq!(ops, vec![CmpOp::Le(2), CmpOp::Gt(16), CmpOp::Ge(4), CmpOp::Lt(8)]);
            }
            other => panic!("{:?}", other),
        }
        match action(&doc, "fcntl") {
            Action::AllowIf { predicate, .. } => {
                assert_eq!(predicate.clauses[0].comparisons[0].op, CmpOp::Eq(u64::MAX));
                assert_eq!(predicate.clauses[1].comparisons[0].op, CmpOp::Eq(!3u64));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_line_continuation() {
        let doc = parse("# c\nioctl: arg1 == 1 || \\\n       arg1 == 2 \\\n       || arg1 == 3\nread: 1\n").unwrap();
        match action(&doc, "ioctl") {
            Action::AllowIf { predicate, .. } => assert_eq!(predicate.clauses.len(), 3),
            other => panic!("{:?}", other),
        }
        assert_eq!(doc.rule("ioctl").unwrap().location.line, 2);
        assert_eq!(doc.rule("read").unwrap().location.line, 5);
    }

    #[test]
    fn test_same_file_repeats_merge() {
        let doc = parse(
            "ioctl: arg1 == 1; return EPERM\nread: 1\nioctl: arg1 == 2; return EPERM\nread: allow\n",
        )
        .unwrap();
        assert_eq!(doc.rules.len(), 2);
        assert_eq!(doc.rules[0].syscall, "ioctl");
        match action(&doc, "ioctl") {
            Action::AllowIf { predicate, otherwise } => {
                assert_eq!(predicate.clauses.len(), 2);
                assert_eq!(otherwise, Some(Verdict::Deny(1)));
            }
            other => panic!("{:?}", other),
        }

        let doc = parse("ioctl: arg1 == 1\nioctl: arg1 == 2\n").unwrap();
        assert!(matches!(action(&doc, "ioctl"), Action::AllowIf { otherwise: None, .. }));
    }

    #[test]
    fn test_repeat_cannot_add_fallback() {
        for text in [
            "ioctl: arg1 == 1\nioctl: arg1 == 2; return EPERM\n",
            "ioctl: arg1 == 1; return EPERM\nioctl: arg1 == 2\n",
        ] {
            match parse(text).unwrap_err() {
                PolicyError::DuplicateSyscall { syscall, first, second } => {
                    assert_eq!(syscall, "ioctl");
                    assert_eq!((first.line, second.line), (1, 2));
                }
                other => panic!("{:?}", other),
            }
        }
    }

    #[test]
    fn test_same_file_conflicting_repeat() {
        let err = parse("open: 1\nopen: return ENOENT\n").unwrap_err();
        match err {
            PolicyError::DuplicateSyscall { syscall, first, second } => {
                assert_eq!(syscall, "open");
                assert_eq!(first.line, 1);
                assert_eq!(second.line, 2);
            }
            other => panic!("{:?}", other),
        }
        assert!(parse("ioctl: arg0 == 1; return EPERM\nioctl: arg0 == 2; trap\n").is_err());
    }

    #[test]
    fn test_unresolved_symbol() {
        let err = parse("read: 1\nioctl: arg1 == KVM_RUN\n").unwrap_err();
        match err {
            PolicyError::UnresolvedSymbol { symbol, location } => {
                assert_eq!(symbol, "KVM_RUN");
                assert_eq!(location.line, 2);
            }
            other => panic!("{:?}", other),
        }
        assert!(matches!(
            parse("open: return EBOGUS").unwrap_err(),
            PolicyError::UnresolvedSymbol { .. }
        ));
    }

    #[test]
    fn test_parse_error_positions() {
        match parse("read: 1\nioctl: arg1 === 4\n").unwrap_err() {
            PolicyError::Parse { line, column, .. } => {
                assert_eq!(line, 2);
                assert_eq!(column, 15);
            }
            other => panic!("{:?}", other),
        }
        // second physical line of a continued statement
        match parse("read: 1\nioctl: arg1 == 1 || \\\n    arg1 === 2\n").unwrap_err() {
            PolicyError::Parse { line, column, .. } => assert_eq!((line, column), (3, 12)),
            other => panic!("{:?}", other),
        }
        match parse("write 1").unwrap_err() {
            PolicyError::Parse { line, column, .. } => assert_eq!((line, column), (1, 1)),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_malformed_rules() {
        for bad in [
            "read:",
            "read: yes",
            "re ad: 1",
            "read: 1; return EPERM",
            "ioctl: arg1 == 1; allow",
            "ioctl: arg1 ==",
            "ioctl: arg1 == (1",
            "ioctl: arg1 == 1 ||",
            "ioctl: arg1 & 4 != 1",
            "ioctl: arg1 == 1 $",
            "ioctl: arg1 == 1 arg2",
            "ioctl: arg300 == 1",
            "read: trace",
        ] {
            assert!(
                matches!(parse(bad), Err(PolicyError::Parse { .. })),
                "expected parse error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_frequency_file() {
        let counts = parse_frequency("dev.frequency", "# counts\nread: 120\nioctl: 0x10\n").unwrap();
        assert_eq!(counts, vec![("read".to_string(), 120), ("ioctl".to_string(), 16)]);
        assert!(parse_frequency("dev.frequency", "read 12").is_err());
        assert!(parse_frequency("dev.frequency", "read: many").is_err());
    }
}

//! Parsing patch scripts into directives.
//!
//! A patch script is line-oriented. After comments are stripped (see [`strip_comment`])
//! and blank lines are skipped, every line is one of two directives:
//! - an anchor (`Symbol+Offset:`), which moves the write cursor to `Offset` bytes (hex) past `Symbol`
//! - an instruction (any other text), which is assembled at the write cursor
//!
//! ```text
//! // Hook the move power calculation
//! GetMovePower+0x1C:
//!     bl CustomGetMovePower    ; symbolic branch target
//!     nop
//! ```
//!
//! Parsing only classifies lines and finds the symbolic operands an instruction refers to.
//! Resolving those symbols and assembling happens in [`crate::patch`].

pub mod lex;

use std::borrow::Cow;

use logos::Logos;

use self::lex::{parse_hex, parse_int, LexErr, Token};

/// A parsed directive with the line it came from.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Stmt {
    /// The directive.
    pub directive: Directive,
    /// The 1-based line number of the directive in the script.
    pub line: usize,
}

/// A patch script directive.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Directive {
    /// Moves the write cursor to `offset` bytes past `symbol`.
    Anchor {
        /// The symbol to anchor at.
        symbol: String,
        /// The offset from the symbol, in bytes.
        offset: u32,
    },
    /// An instruction (or data literal) to assemble at the write cursor.
    Instr(Instr),
}

/// An instruction line.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Instr {
    /// The instruction text, with comments and surrounding whitespace removed.
    pub text: String,
    /// The symbolic operand of this instruction, if it has one.
    pub operand: Option<SymbolOperand>,
}

/// How a symbolic operand is rewritten before assembly.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum OperandKind {
    /// A branch target (`b`, `bl`, and their conditional forms),
    /// rewritten to the displacement from the instruction to the target.
    Branch,
    /// A data literal (`.word`, `.int`), rewritten to the absolute address of the symbol.
    Word,
}

/// A symbol referenced as an operand of an instruction.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SymbolOperand {
    /// The referenced symbol.
    pub symbol: String,
    /// How the operand is rewritten.
    pub kind: OperandKind,
}

impl Instr {
    /// Creates an instruction from its text, detecting any symbolic operand.
    pub fn new(text: &str) -> Self {
        let text = text.trim();
        let mut words = text.split_whitespace();

        let operand = match (words.next(), words.next(), words.next()) {
            (Some(mnemonic), Some(op), None) => {
                let kind = if is_branch_mnemonic(mnemonic) {
                    Some(OperandKind::Branch)
                } else if is_word_directive(mnemonic) {
                    Some(OperandKind::Word)
                } else {
                    None
                };

                kind.filter(|_| !is_numeric_operand(op))
                    .map(|kind| SymbolOperand { symbol: op.to_string(), kind })
            },
            _ => None
        };

        Self { text: text.to_string(), operand }
    }

    /// The instruction's text with its operand replaced by `value`.
    ///
    /// Only instructions with a symbolic operand have one operand to replace;
    /// for any other instruction, this is the original text.
    pub fn with_operand(&self, value: &str) -> Cow<'_, str> {
        match (&self.operand, self.text.split_whitespace().next()) {
            (Some(_), Some(mnemonic)) => Cow::Owned(format!("{mnemonic} {value}")),
            _ => Cow::Borrowed(&self.text),
        }
    }
}

const CONDITION_CODES: [&str; 16] = [
    "eq", "ne", "cs", "hs", "cc", "lo", "mi", "pl",
    "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
];

/// Checks if a mnemonic is a relative branch (`b`/`bl` with an optional condition code).
///
/// ```
/// use cot_patcher::parse::is_branch_mnemonic;
///
/// assert!(is_branch_mnemonic("bl"));
/// assert!(is_branch_mnemonic("BNE"));
/// assert!(is_branch_mnemonic("bls")); // b + ls
/// assert!(is_branch_mnemonic("bleq"));
/// assert!(!is_branch_mnemonic("bx"));
/// assert!(!is_branch_mnemonic("blx"));
/// ```
pub fn is_branch_mnemonic(mnemonic: &str) -> bool {
    let m = mnemonic.to_ascii_lowercase();
    let is_cond = |c: &str| c.is_empty() || c == "al" || CONDITION_CODES.contains(&c);

    // `bl` is tried first, but `blt`/`ble`/`bls` are `b` with a condition.
    let as_bl = m.strip_prefix("bl").is_some_and(is_cond);
    let as_b  = m.strip_prefix('b').is_some_and(is_cond);
    as_bl || as_b
}

fn is_word_directive(mnemonic: &str) -> bool {
    matches!(&*mnemonic.to_ascii_lowercase(), ".word" | ".int")
}

/// Reads a numeric operand (decimal or hex, optionally prefixed by `#` and `-`).
///
/// Returns `None` if the operand is not a number.
///
/// ```
/// use cot_patcher::parse::numeric_operand;
///
/// assert_eq!(numeric_operand("0x1FC"), Some(0x1FC));
/// assert_eq!(numeric_operand("#-0x10"), Some(-0x10));
/// assert_eq!(numeric_operand("256"), Some(256));
/// assert_eq!(numeric_operand("0x1FCg"), None);
/// assert_eq!(numeric_operand("OtherFunc"), None);
/// ```
pub fn numeric_operand(op: &str) -> Option<i64> {
    let tokens = Token::lexer(op).collect::<Result<Vec<_>, _>>().ok()?;

    let rest = match &*tokens {
        [Token::Hash, rest @ ..] => rest,
        rest => rest,
    };
    let (sign, rest) = match rest {
        [Token::Minus, rest @ ..] => (-1, rest),
        rest => (1, rest),
    };
    match rest {
        [Token::Number(n)] => parse_int(n).ok().map(|n| sign * i64::from(n)),
        _ => None
    }
}

/// Checks if an operand is a numeric literal (e.g. `16`, `0x1FC`, `#-0x10`).
///
/// Any other operand of a branch or `.word` is read as a symbol.
pub fn is_numeric_operand(op: &str) -> bool {
    numeric_operand(op).is_some()
}

/// Removes a comment from a line.
///
/// `//` and `;` start a comment anywhere on the line.
/// `#` starts a comment at the start of a line, or when it stands alone between whitespace
/// (so immediates like `#4` are kept).
///
/// ```
/// use cot_patcher::parse::strip_comment;
///
/// assert_eq!(strip_comment("bl Func // call"), "bl Func ");
/// assert_eq!(strip_comment("mov r0, #4 ; four"), "mov r0, #4 ");
/// assert_eq!(strip_comment("mov r0, #4 # four"), "mov r0, #4 ");
/// assert_eq!(strip_comment("# heading"), "");
/// assert_eq!(strip_comment("mov r0, #4"), "mov r0, #4");
/// ```
pub fn strip_comment(line: &str) -> &str {
    let mut end = ["//", ";"].into_iter()
        .filter_map(|pat| line.find(pat))
        .min()
        .unwrap_or(line.len());

    let bytes = line.as_bytes();
    let hash_comment = line[..end].match_indices('#')
        .map(|(i, _)| i)
        .find(|&i| {
            let at_start   = line[..i].trim().is_empty();
            let ws_before  = i > 0 && bytes[i - 1].is_ascii_whitespace();
            let ws_after   = bytes.get(i + 1).map_or(true, u8::is_ascii_whitespace);
            at_start || (ws_before && ws_after)
        });
    if let Some(i) = hash_comment {
        end = i;
    }

    &line[..end]
}

/// Kinds of errors that can occur from parsing a patch script.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ParseErrKind {
    /// A line ending with `:` is not of the form `Symbol+Offset:`.
    MalformedAnchor,
    /// The anchor could not be tokenized or its offset could not be read.
    Lex(LexErr),
}
impl std::fmt::Display for ParseErrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedAnchor => f.write_str("malformed anchor"),
            Self::Lex(e)          => e.fmt(f),
        }
    }
}

/// Error from parsing a patch script.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ParseErr {
    /// The kind of error.
    pub kind: ParseErrKind,
    /// The 1-based line the error occurred on.
    pub line: usize,
}
impl std::fmt::Display for ParseErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}
impl std::error::Error for ParseErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ParseErrKind::Lex(e) => Some(e),
            ParseErrKind::MalformedAnchor => None,
        }
    }
}
impl crate::err::Error for ParseErr {
    fn location(&self) -> Option<crate::err::SrcLoc> {
        Some(crate::err::SrcLoc::new(None, self.line))
    }

    fn help(&self) -> Option<Cow<'_, str>> {
        match &self.kind {
            ParseErrKind::MalformedAnchor => Some("anchors have the form `Symbol+Offset:`, with the offset in hex".into()),
            ParseErrKind::Lex(e) => crate::err::Error::help(e),
        }
    }
}

/// Parses one line (without its comment) into a directive.
///
/// Returns `None` for a blank line.
pub fn parse_line(line: &str) -> Result<Option<Directive>, ParseErrKind> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.ends_with(':') {
        return Ok(Some(Directive::Instr(Instr::new(line))));
    }

    let tokens = Token::lexer(line)
        .collect::<Result<Vec<_>, _>>()
        .map_err(ParseErrKind::Lex)?;

    match &*tokens {
        [Token::Ident(symbol), Token::Colon] => Ok(Some(Directive::Anchor { symbol: symbol.clone(), offset: 0 })),
        [Token::Ident(symbol), Token::Plus, Token::Number(off) | Token::Ident(off), Token::Colon] => {
            let offset = parse_hex(off).map_err(ParseErrKind::Lex)?;
            Ok(Some(Directive::Anchor { symbol: symbol.clone(), offset }))
        },
        _ => Err(ParseErrKind::MalformedAnchor),
    }
}

/// Parses a patch script into its directives, in file order.
///
/// # Example
/// ```
/// use cot_patcher::parse::{parse_script, Directive};
///
/// let src = "
///     // hook
///     MyFunc+0x4:
///         bl OtherFunc
/// ";
/// let stmts = parse_script(src).unwrap();
/// assert_eq!(stmts.len(), 2);
/// assert_eq!(stmts[0].line, 3);
/// assert_eq!(stmts[0].directive, Directive::Anchor { symbol: "MyFunc".to_string(), offset: 4 });
/// ```
pub fn parse_script(src: &str) -> Result<Vec<Stmt>, ParseErr> {
    src.lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let line_no = i + 1;
            parse_line(strip_comment(line))
                .map_err(|kind| ParseErr { kind, line: line_no })
                .transpose()
                .map(|r| r.map(|directive| Stmt { directive, line: line_no }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{is_numeric_operand, numeric_operand, parse_line, parse_script, strip_comment, Directive, Instr, OperandKind, ParseErrKind, SymbolOperand};
    use crate::err::LexErr;

    fn anchor(symbol: &str, offset: u32) -> Option<Directive> {
        Some(Directive::Anchor { symbol: symbol.to_string(), offset })
    }
    fn operand(instr: &str) -> Option<SymbolOperand> {
        Instr::new(instr).operand
    }
    fn branch(symbol: &str) -> Option<SymbolOperand> {
        Some(SymbolOperand { symbol: symbol.to_string(), kind: OperandKind::Branch })
    }

    #[test]
    fn test_anchor() {
        assert_eq!(parse_line("MyFunc+0x4:"), Ok(anchor("MyFunc", 4)));
        assert_eq!(parse_line("MyFunc+10:"), Ok(anchor("MyFunc", 0x10)));
        assert_eq!(parse_line("MyFunc+A0:"), Ok(anchor("MyFunc", 0xA0)));
        assert_eq!(parse_line("  MyFunc + 0x1C :  "), Ok(anchor("MyFunc", 0x1C)));
        assert_eq!(parse_line("MyFunc:"), Ok(anchor("MyFunc", 0)));
    }

    #[test]
    fn test_malformed_anchor() {
        assert_eq!(parse_line("MyFunc-4:"), Err(ParseErrKind::MalformedAnchor));
        assert_eq!(parse_line("+4:"), Err(ParseErrKind::MalformedAnchor));
        assert_eq!(parse_line("MyFunc+4+4:"), Err(ParseErrKind::MalformedAnchor));
        assert_eq!(parse_line("MyFunc+0xZZ:"), Err(ParseErrKind::Lex(LexErr::InvalidHex)));
        assert_eq!(parse_line("My Func+4:"), Err(ParseErrKind::MalformedAnchor));
        assert_eq!(parse_line("MyFunc[4]:"), Err(ParseErrKind::Lex(LexErr::InvalidSymbol)));
    }

    #[test]
    fn test_instr_operands() {
        assert_eq!(operand("bl OtherFunc"), branch("OtherFunc"));
        assert_eq!(operand("BLEQ OtherFunc"), branch("OtherFunc"));
        assert_eq!(operand("bgt  OtherFunc"), branch("OtherFunc"));
        assert_eq!(operand(".word OtherFunc"), Some(SymbolOperand { symbol: "OtherFunc".to_string(), kind: OperandKind::Word }));

        // Anything which is not a number is a symbol, even if it is not an identifier:
        assert_eq!(operand("bl 3Q"), branch("3Q"));
        assert_eq!(operand("b 0x1FCg"), branch("0x1FCg"));
        assert_eq!(operand("bl OtherFunc+4"), branch("OtherFunc+4"));

        // Numeric operands are left alone:
        assert_eq!(operand("bl 0x100"), None);
        assert_eq!(operand("bl -0x10"), None);
        assert_eq!(operand("b #-0x10"), None);
        assert_eq!(operand("b 256"), None);
        assert_eq!(operand(".word 0x1234"), None);

        // Not branches:
        assert_eq!(operand("bx lr"), None);
        assert_eq!(operand("blx r3"), None);
        assert_eq!(operand("mov r0, r1"), None);
        assert_eq!(operand("nop"), None);
    }

    #[test]
    fn test_with_operand() {
        let instr = Instr::new("  bl\tOtherFunc ");
        assert_eq!(instr.text, "bl\tOtherFunc");
        assert_eq!(instr.with_operand("0x1fc"), "bl 0x1fc");

        let instr = Instr::new("mov r0, #1");
        assert_eq!(instr.with_operand("0x1fc"), "mov r0, #1");
    }

    #[test]
    fn test_numeric_operand() {
        assert!(is_numeric_operand("16"));
        assert!(is_numeric_operand("0x1FC"));
        assert!(is_numeric_operand("#0x10"));
        assert!(is_numeric_operand("-0x10"));
        assert!(!is_numeric_operand("Func"));
        assert!(!is_numeric_operand("3Q"));
        assert!(!is_numeric_operand("[r0]"));
        assert!(!is_numeric_operand("0x1FCg"));

        assert_eq!(numeric_operand("-0x10"), Some(-16));
        assert_eq!(numeric_operand("#0xFFFFFFFF"), Some(0xFFFF_FFFF));
        assert_eq!(numeric_operand("0x100000000"), None);
    }

    #[test]
    fn test_err_kinds_hashable() {
        let kinds = HashSet::from([
            ParseErrKind::MalformedAnchor,
            ParseErrKind::Lex(LexErr::InvalidHex),
            ParseErrKind::Lex(LexErr::InvalidHex),
        ]);
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&parse_line("MyFunc+0xZZ:").unwrap_err()));
    }

    #[test]
    fn test_comments() {
        assert_eq!(strip_comment("// only a comment"), "");
        assert_eq!(strip_comment("; only a comment"), "");
        assert_eq!(strip_comment("   # only a comment"), "   ");
        assert_eq!(strip_comment("ldr r0, [r1, #4]! // load"), "ldr r0, [r1, #4]! ");
        assert_eq!(strip_comment("Func+0x4: ; anchor"), "Func+0x4: ");
    }

    #[test]
    fn test_script() {
        let src = "
            # A script.
            MyFunc+0x4:
                bl OtherFunc    // call
                nop

            ; second hook
            OtherFunc+0x10:
                mov r0, #0
        ";
        let stmts = parse_script(src).unwrap();
        let lines: Vec<_> = stmts.iter().map(|s| s.line).collect();
        assert_eq!(lines, [3, 4, 5, 8, 9]);
        assert_eq!(stmts[0].directive, anchor("MyFunc", 4).unwrap());
        assert!(matches!(&stmts[1].directive, Directive::Instr(Instr { operand: Some(_), .. })));
        assert!(matches!(&stmts[4].directive, Directive::Instr(i) if i.text == "mov r0, #0"));

        let err = parse_script("MyFunc+0x4:\n  nop\nBroken-:\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert_eq!(err.kind, ParseErrKind::MalformedAnchor);
    }
}

//! Tokenizing patch script lines.
//!
//! This module holds the tokens which make up the symbolic parts of a patch script ([`Token`]):
//! anchor lines (`HookedFunc+0x1C:`) and symbolic operands (`bl CustomFunc`).
//!
//! Instruction text as a whole is never tokenized here. It is handed to the assembler
//! as-is, apart from the single operand the interpreter rewrites.

use std::num::IntErrorKind;

use logos::Logos;

/// A unit of information in the symbolic part of a patch script line.
#[derive(Debug, Logos, PartialEq, Eq, Clone)]
#[logos(skip r"[ \t]+", error = LexErr)]
pub enum Token {
    // Like identifiers, numbers are collected as one discernable unit
    // (e.g., `3Q` is one number token) and validated by whoever reads them,
    // since anchor offsets and operands read numbers differently.

    /// A numeric literal (e.g., `16`, `0x1FC`).
    #[regex(r"\d\w*", |lx| lx.slice().to_string())]
    Number(String),

    /// An identifier (e.g., `CustomFunc`, `_ZN4core3fmt5write17h`, `.word`).
    #[regex(r"[A-Za-z_.$][\w.$@]*", |lx| lx.slice().to_string())]
    Ident(String),

    /// A plus, which separates an anchor symbol from its offset.
    #[token("+")]
    Plus,

    /// A minus, which can prefix a numeric operand.
    #[token("-")]
    Minus,

    /// A hash, which can prefix a numeric operand (`#0x10`).
    #[token("#")]
    Hash,

    /// A colon, which ends an anchor.
    #[token(":")]
    Colon,
}

/// Any errors raised in attempting to tokenize or read a patch script line.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum LexErr {
    /// Numeric literal cannot fit within the range of a u32.
    DoesNotFitU32,
    /// Hex literal has invalid hex digits.
    InvalidHex,
    /// Hex literal (starting with 0x) doesn't have digits after it.
    InvalidHexEmpty,
    /// Numeric literal could not be parsed as a decimal literal because it has invalid digits.
    InvalidNumeric,
    /// A symbol was used which is not allowed in an anchor or symbolic operand.
    #[default]
    InvalidSymbol,
}
impl std::fmt::Display for LexErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LexErr::DoesNotFitU32   => f.write_str("numeric token does not fit 32-bit unsigned integer"),
            LexErr::InvalidHex      => f.write_str("invalid hex literal"),
            LexErr::InvalidHexEmpty => f.write_str("invalid hex literal"),
            LexErr::InvalidNumeric  => f.write_str("invalid decimal literal"),
            LexErr::InvalidSymbol   => f.write_str("unrecognized symbol"),
        }
    }
}
impl std::error::Error for LexErr {}
impl crate::err::Error for LexErr {
    fn help(&self) -> Option<std::borrow::Cow<'_, str>> {
        match self {
            LexErr::DoesNotFitU32   => Some(format!("the range for a 32-bit unsigned integer is [{}, 0x{:X}]", u32::MIN, u32::MAX).into()),
            LexErr::InvalidHex      => Some("a hex literal consists of 0-9, A-F (optionally prefixed by 0x)".into()),
            LexErr::InvalidHexEmpty => Some("there should be hex digits (0-9, A-F) here".into()),
            LexErr::InvalidNumeric  => Some("a decimal literal only consists of digits 0-9".into()),
            LexErr::InvalidSymbol   => Some("anchors have the form `Symbol+Offset:`".into()),
        }
    }
}

fn convert_int_error(e: &IntErrorKind, invalid_digits_err: LexErr, empty_err: LexErr) -> LexErr {
    match e {
        IntErrorKind::Empty        => empty_err,
        IntErrorKind::PosOverflow  => LexErr::DoesNotFitU32,
        IntErrorKind::NegOverflow  => LexErr::DoesNotFitU32,
        _ => invalid_digits_err,
    }
}

/// Reads a hexadecimal number, with or without a `0x` prefix.
///
/// Anchor offsets are always hexadecimal, so `Func+10:` is 16 bytes after `Func`.
pub fn parse_hex(s: &str) -> Result<u32, LexErr> {
    let digits = s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    u32::from_str_radix(digits, 16)
        .map_err(|e| convert_int_error(e.kind(), LexErr::InvalidHex, LexErr::InvalidHexEmpty))
}

/// Reads an integer literal, which is hexadecimal if prefixed by `0x` and decimal otherwise.
pub fn parse_int(s: &str) -> Result<u32, LexErr> {
    match s.starts_with("0x") || s.starts_with("0X") {
        true  => parse_hex(s),
        false => s.parse::<u32>()
            .map_err(|e| convert_int_error(e.kind(), LexErr::InvalidNumeric, LexErr::InvalidNumeric)),
    }
}

#[cfg(test)]
mod tests {
    use logos::Logos;

    use crate::err::LexErr;
    use crate::parse::lex::{parse_hex, parse_int, Token};

    fn ident(s: &str) -> Token {
        Token::Ident(s.to_string())
    }
    fn number(s: &str) -> Token {
        Token::Number(s.to_string())
    }

    #[test]
    fn test_anchor_tokens() {
        let mut tokens = Token::lexer("GetMovePower+0x1C:");
        assert_eq!(tokens.next(), Some(Ok(ident("GetMovePower"))));
        assert_eq!(tokens.next(), Some(Ok(Token::Plus)));
        assert_eq!(tokens.next(), Some(Ok(number("0x1C"))));
        assert_eq!(tokens.next(), Some(Ok(Token::Colon)));
        assert_eq!(tokens.next(), None);

        let mut tokens = Token::lexer("  Func + 4 :");
        assert_eq!(tokens.next(), Some(Ok(ident("Func"))));
        assert_eq!(tokens.next(), Some(Ok(Token::Plus)));
        assert_eq!(tokens.next(), Some(Ok(number("4"))));
        assert_eq!(tokens.next(), Some(Ok(Token::Colon)));
        assert_eq!(tokens.next(), None);
    }

    #[test]
    fn test_operand_tokens() {
        let mut tokens = Token::lexer("#-0x10");
        assert_eq!(tokens.next(), Some(Ok(Token::Hash)));
        assert_eq!(tokens.next(), Some(Ok(Token::Minus)));
        assert_eq!(tokens.next(), Some(Ok(number("0x10"))));
        assert_eq!(tokens.next(), None);

        let mut tokens = Token::lexer("_ZN6eos_rs4main17h0a1b2c3d4e5f6a7bE .word $a");
        assert_eq!(tokens.next(), Some(Ok(ident("_ZN6eos_rs4main17h0a1b2c3d4e5f6a7bE"))));
        assert_eq!(tokens.next(), Some(Ok(ident(".word"))));
        assert_eq!(tokens.next(), Some(Ok(ident("$a"))));
        assert_eq!(tokens.next(), None);
    }

    #[test]
    fn test_invalid_symbol() {
        for s in ["[", "]", "{", "!", "=", "*", "/", "\"", ","] {
            assert_eq!(
                Token::lexer(s).next(),
                Some(Err(LexErr::InvalidSymbol)),
                "Expected {s:?} to be an invalid symbol"
            );
        }
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x1C"), Ok(0x1C));
        assert_eq!(parse_hex("1C"), Ok(0x1C));
        assert_eq!(parse_hex("10"), Ok(0x10));
        assert_eq!(parse_hex("0XffffFFFF"), Ok(0xFFFF_FFFF));
        assert_eq!(parse_hex("0x1_0000_0000"), Err(LexErr::InvalidHex));
        assert_eq!(parse_hex("100000000"), Err(LexErr::DoesNotFitU32));
        assert_eq!(parse_hex("0x"), Err(LexErr::InvalidHexEmpty));
        assert_eq!(parse_hex("0xQ"), Err(LexErr::InvalidHex));
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("16"), Ok(16));
        assert_eq!(parse_int("0x16"), Ok(0x16));
        assert_eq!(parse_int("0"), Ok(0));
        assert_eq!(parse_int("3Q"), Err(LexErr::InvalidNumeric));
        assert_eq!(parse_int("4294967296"), Err(LexErr::DoesNotFitU32));
    }
}

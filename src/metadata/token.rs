//! Metadata tokens and the tables they index.
//!
//! A token is the 32-bit handle the IL stream uses to refer to metadata: the high byte names
//! the table, the low 24 bits the row. The compiler only ever resolves tokens through the
//! [`crate::metadata::MetadataStore`]; this module provides the typed wrapper and the table
//! classification used to dispatch that resolution.

use std::fmt;

use strum::{Display, FromRepr};

/// The metadata tables (and the user-string heap) a token can index.
///
/// Only the tables the code generator resolves tokens against are listed; the numbering
/// follows ECMA-335 II.22.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum TokenTable {
    /// `TypeRef` (0x01)
    TypeRef = 0x01,
    /// `TypeDef` (0x02)
    TypeDef = 0x02,
    /// `Field` (0x04)
    Field = 0x04,
    /// `MethodDef` (0x06)
    MethodDef = 0x06,
    /// `MemberRef` (0x0A)
    MemberRef = 0x0A,
    /// `StandAloneSig` (0x11)
    StandAloneSig = 0x11,
    /// `TypeSpec` (0x1B)
    TypeSpec = 0x1B,
    /// `MethodSpec` (0x2B)
    MethodSpec = 0x2B,
    /// The `#US` heap (0x70), used by `ldstr`
    UserString = 0x70,
}

/// A metadata token: table index in the high byte, 1-based row in the low 24 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Build a token from its raw value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Token(value)
    }

    /// Build a token from a table and a row.
    #[must_use]
    pub const fn from_parts(table: TokenTable, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    /// The raw 32-bit value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The table byte.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The table this token indexes, if it is one the compiler knows.
    #[must_use]
    pub fn kind(&self) -> Option<TokenTable> {
        TokenTable::from_repr(self.table())
    }

    /// The row within the table.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// A zero row means "no entity".
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.row() == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "Token(0x{:08x}, {}, row: {})", self.0, kind, self.row()),
            None => write!(
                f,
                "Token(0x{:08x}, table: 0x{:02x}, row: {})",
                self.0,
                self.table(),
                self.row()
            ),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_roundtrip() {
        let token = Token::from_parts(TokenTable::MethodDef, 7);
        assert_eq!(token.value(), 0x0600_0007);
        assert_eq!(token.kind(), Some(TokenTable::MethodDef));
        assert_eq!(token.row(), 7);
    }

    #[test]
    fn user_string_and_unknown_tables() {
        assert_eq!(Token(0x7000_0001).kind(), Some(TokenTable::UserString));
        assert_eq!(Token(0x2000_0001).kind(), None);
        assert!(format!("{:?}", Token(0x2000_0001)).contains("table: 0x20"));
    }

    #[test]
    fn null_rows() {
        assert!(Token(0x0200_0000).is_null());
        assert!(!Token(0x0200_0001).is_null());
    }

    #[test]
    fn display_and_debug() {
        let token = Token(0x0A00_0010);
        assert_eq!(token.to_string(), "0x0a000010");
        assert!(format!("{token:?}").contains("MemberRef"));
    }
}

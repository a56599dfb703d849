use std::fmt;
use std::hash::{Hash, Hasher};

use strum::{EnumCount, EnumIter};

/// A metadata token representing a reference to a metadata table entry.
///
/// Tokens in .NET metadata consist of a 32-bit value where:
/// - The high byte (bits 24-31) indicates the table type
/// - The low 24 bits (bits 0-23) indicate the row index within that table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Token(pub u32);

impl Token {
    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table and a row index
    #[must_use]
    pub fn from_parts(table: TableId, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Returns the table as a [`TableId`], if it is one this crate models
    #[must_use]
    pub fn table_id(&self) -> Option<TableId> {
        TableId::from_byte(self.table())
    }

    /// Returns `true` if the token points into the given table
    #[must_use]
    pub fn is_table(&self, table: TableId) -> bool {
        self.table() == table as u8
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
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
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// The metadata tables a token may point into.
///
/// Only the tables the constants engine resolves are listed; the discriminant is the table
/// byte stored in the high bits of a [`Token`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, EnumIter, EnumCount)]
#[repr(u8)]
pub enum TableId {
    /// `TypeRef` - references to types in other assemblies
    TypeRef = 0x01,
    /// `TypeDef` - types defined in the module
    TypeDef = 0x02,
    /// `Field` - field definitions
    Field = 0x04,
    /// `MethodDef` - method definitions
    MethodDef = 0x06,
    /// `MemberRef` - references to external fields and methods
    MemberRef = 0x0A,
    /// `TypeSpec` - constructed type signatures
    TypeSpec = 0x1B,
    /// `MethodSpec` - generic method instantiations
    MethodSpec = 0x2B,
}

impl TableId {
    /// Maps a raw table byte to a [`TableId`]
    #[must_use]
    pub fn from_byte(value: u8) -> Option<Self> {
        use strum::IntoEnumIterator;
        TableId::iter().find(|table| *table as u8 == value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use strum::IntoEnumIterator;

    #[test]
    fn test_token_new() {
        let token = Token::new(0x06000001);
        assert_eq!(token.value(), 0x06000001);
    }

    #[test]
    fn test_token_table() {
        let token = Token(0x06000001);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.table_id(), Some(TableId::MethodDef));

        let token2 = Token(0x2B000005);
        assert_eq!(token2.table_id(), Some(TableId::MethodSpec));

        let token3 = Token(0x70000001);
        assert_eq!(token3.table_id(), None);
    }

    #[test]
    fn test_token_row() {
        let token = Token(0x06000001);
        assert_eq!(token.row(), 1);

        let token2 = Token(0x06FFFFFF);
        assert_eq!(token2.row(), 0x00FFFFFF);
    }

    #[test]
    fn test_token_from_parts() {
        let token = Token::from_parts(TableId::Field, 3);
        assert_eq!(token, Token(0x04000003));
        assert!(token.is_table(TableId::Field));
        assert!(!token.is_table(TableId::TypeDef));
    }

    #[test]
    fn test_token_display_and_debug() {
        let token = Token(0x0A00002C);
        assert_eq!(format!("{token}"), "0x0a00002c");
        assert_eq!(
            format!("{token:?}"),
            "Token(0x0a00002c, table: 0x0a, row: 44)"
        );
    }

    #[test]
    fn test_token_hash() {
        let mut map = HashMap::new();
        map.insert(Token(0x02000001), "Module");
        assert_eq!(map.get(&Token(0x02000001)), Some(&"Module"));
        assert!(Token(0).is_null());
    }

    #[test]
    fn test_table_id_round_trip() {
        for table in TableId::iter() {
            assert_eq!(TableId::from_byte(table as u8), Some(table));
        }
        assert_eq!(TableId::COUNT, 7);
    }
}

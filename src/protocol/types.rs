//! Common PostgreSQL wire protocol types.

/// PostgreSQL Object Identifier (OID).
pub type Oid = u32;

/// Data format code in the PostgreSQL protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum FormatCode {
    /// Text format (human-readable).
    #[default]
    Text = 0,
    /// Binary format (type-specific packed representation).
    Binary = 1,
}

impl FormatCode {
    /// Create a FormatCode from a raw u16 value.
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => FormatCode::Binary,
            _ => FormatCode::Text,
        }
    }
}

impl From<u16> for FormatCode {
    fn from(value: u16) -> Self {
        Self::from_u16(value)
    }
}

/// Transaction status indicator carried on the wire by ReadyForQuery.
///
/// The server only ever reports one of these three; `Pending` is a purely
/// client-side bookkeeping state layered on top by the connector (see
/// `crate::connector::TransactionStatus`), never sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionIndicator {
    /// Idle (not in a transaction block).
    Idle = b'I',
    /// In a transaction block.
    InTransaction = b'T',
    /// In a failed transaction block (queries rejected until rollback).
    Failed = b'E',
}

impl TransactionIndicator {
    /// Parse a transaction status byte from ReadyForQuery.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            b'I' => Some(Self::Idle),
            b'T' => Some(Self::InTransaction),
            b'E' => Some(Self::Failed),
            _ => None,
        }
    }
}

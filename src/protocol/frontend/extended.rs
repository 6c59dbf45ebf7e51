//! Extended query protocol messages.

use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::{FormatCode, Oid};

/// Write a Parse message to create a prepared statement.
///
/// - `name`: Statement name (empty string for unnamed statement)
/// - `query`: SQL query with $1, $2, ... placeholders
/// - `param_oids`: Parameter type OIDs (0 = let server infer)
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str, param_oids: &[Oid]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(param_oids.len() as i16);
    for &oid in param_oids {
        msg.write_i32(oid as i32);
    }
    msg.finish();
}

/// Write a Bind message to create a portal from a prepared statement.
///
/// Parameter values are already encoded by the caller (the type-handler
/// registry lives above this crate, see spec §1 OUT OF SCOPE); `None` marks a
/// SQL NULL.
///
/// - `portal`: Portal name (empty string for unnamed portal)
/// - `statement`: Statement name
/// - `param_formats`: Format code for each parameter
/// - `params`: Pre-encoded parameter bytes, in order
/// - `result_formats`: Format codes for results
pub fn write_bind(
    buf: &mut Vec<u8>,
    portal: &str,
    statement: &str,
    param_formats: &[FormatCode],
    params: &[Option<&[u8]>],
    result_formats: &[FormatCode],
) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);

    msg.write_cstr(portal);
    msg.write_cstr(statement);

    msg.write_i16(param_formats.len() as i16);
    for &fmt in param_formats {
        msg.write_i16(fmt as i16);
    }

    msg.write_i16(params.len() as i16);
    for param in params {
        match param {
            Some(bytes) => {
                msg.write_i32(bytes.len() as i32);
                msg.write_bytes(bytes);
            }
            None => msg.write_i32(-1),
        }
    }

    msg.write_i16(result_formats.len() as i16);
    for &fmt in result_formats {
        msg.write_i16(fmt as i16);
    }

    msg.finish();
}

/// Write an Execute message to run a portal.
///
/// - `portal`: Portal name
/// - `max_rows`: Maximum number of rows to return (0 = unlimited)
pub fn write_execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr(portal);
    msg.write_i32(max_rows as i32);
    msg.finish();
}

/// Write a Describe message to get metadata.
///
/// - `describe_type`: 'S' for statement, 'P' for portal
/// - `name`: Statement or portal name
pub fn write_describe(buf: &mut Vec<u8>, describe_type: u8, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(describe_type);
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Describe message for a statement.
pub fn write_describe_statement(buf: &mut Vec<u8>, name: &str) {
    write_describe(buf, b'S', name);
}

/// Write a Describe message for a portal.
pub fn write_describe_portal(buf: &mut Vec<u8>, name: &str) {
    write_describe(buf, b'P', name);
}

/// Write a Close message to release a statement or portal.
///
/// - `close_type`: 'S' for statement, 'P' for portal
/// - `name`: Statement or portal name
pub fn write_close(buf: &mut Vec<u8>, close_type: u8, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::CLOSE);
    msg.write_u8(close_type);
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Close message for a statement.
pub fn write_close_statement(buf: &mut Vec<u8>, name: &str) {
    write_close(buf, b'S', name);
}

/// Write a Close message for a portal.
pub fn write_close_portal(buf: &mut Vec<u8>, name: &str) {
    write_close(buf, b'P', name);
}

/// Write a Sync message.
///
/// This ends an extended query sequence and causes:
/// - Implicit COMMIT if successful and not in explicit transaction
/// - Implicit ROLLBACK if failed and not in explicit transaction
/// - Server responds with ReadyForQuery
pub fn write_sync(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::SYNC);
    msg.finish();
}

/// Write a Flush message.
///
/// Forces the server to send all pending responses without waiting for Sync.
/// Useful for pipelining when you need intermediate results.
pub fn write_flush(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::FLUSH);
    msg.finish();
}

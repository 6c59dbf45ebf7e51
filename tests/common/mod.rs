//! Scripted mock PostgreSQL server for the black-box scenario tests.
//!
//! No mocking crate: a background thread accepts on a loopback
//! `TcpListener`, drains whatever the client sends, and writes back
//! hand-encoded wire bytes. This mirrors how the teacher's own
//! integration tests stand up a real `Conn` against a real server, except
//! here the "server" is a thread we fully control.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;

pub fn msg(type_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(type_byte);
    out.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

pub fn authentication_ok() -> Vec<u8> {
    msg(b'R', &0i32.to_be_bytes())
}

pub fn backend_key_data(pid: u32, secret: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&pid.to_be_bytes());
    payload.extend_from_slice(&secret.to_be_bytes());
    msg(b'K', &payload)
}

pub fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut payload = cstr(name);
    payload.extend(cstr(value));
    msg(b'S', &payload)
}

pub fn ready_for_query(status: u8) -> Vec<u8> {
    msg(b'Z', &[status])
}

/// A `RowDescription` with a single unnamed int4 column in binary format.
pub fn row_description_one_col(name: &str) -> Vec<u8> {
    let mut payload = 1u16.to_be_bytes().to_vec();
    payload.extend(cstr(name));
    payload.extend_from_slice(&0u32.to_be_bytes()); // table_oid
    payload.extend_from_slice(&0i16.to_be_bytes()); // column_id
    payload.extend_from_slice(&23u32.to_be_bytes()); // type_oid (int4)
    payload.extend_from_slice(&4i16.to_be_bytes()); // type_size
    payload.extend_from_slice(&(-1i32).to_be_bytes()); // type_modifier
    payload.extend_from_slice(&1u16.to_be_bytes()); // format: binary
    msg(b'T', &payload)
}

/// A `DataRow` with a single 4-byte binary int4 column.
pub fn data_row_int4(value: i32) -> Vec<u8> {
    let mut payload = 1u16.to_be_bytes().to_vec();
    payload.extend_from_slice(&4i32.to_be_bytes());
    payload.extend_from_slice(&value.to_be_bytes());
    msg(b'D', &payload)
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    msg(b'C', &cstr(tag))
}

pub fn error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(b'S');
    payload.extend(cstr(severity));
    payload.push(b'V');
    payload.extend(cstr(severity));
    payload.push(b'C');
    payload.extend(cstr(code));
    payload.push(b'M');
    payload.extend(cstr(message));
    payload.push(0);
    msg(b'E', &payload)
}

/// Read a length-prefixed frontend message (or the length-prefixed-only
/// StartupMessage/SSLRequest, which has no leading type byte) and return its
/// raw bytes including whatever type byte it carries, if any.
fn drain_one_length_prefixed_frame(stream: &mut TcpStream, has_type_byte: bool) -> Vec<u8> {
    let header_len = if has_type_byte { 5 } else { 4 };
    let mut header = vec![0u8; header_len];
    stream.read_exact(&mut header).expect("read frame header");
    let len_offset = if has_type_byte { 1 } else { 0 };
    let len = i32::from_be_bytes([
        header[len_offset],
        header[len_offset + 1],
        header[len_offset + 2],
        header[len_offset + 3],
    ]) as usize;
    let mut rest = vec![0u8; len - 4];
    stream.read_exact(&mut rest).expect("read frame body");
    header.extend(rest);
    header
}

/// Drain the 8-byte SSLRequest preamble and reply with `reply_byte`
/// (`b'S'` or `b'N'`). Only valid when the client is known to attempt SSL
/// negotiation (`sslmode` is `Prefer` or `Require`).
pub fn drain_ssl_preamble_and_reply(stream: &mut TcpStream, reply_byte: u8) {
    const SSL_REQUEST_CODE: i32 = 80877103;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).expect("read ssl preamble length");
    let len = i32::from_be_bytes(len_buf) as usize;
    assert_eq!(len, 8, "expected an 8-byte SSLRequest preamble");

    let mut rest = vec![0u8; len - 4];
    stream.read_exact(&mut rest).expect("read ssl preamble body");
    let code = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    assert_eq!(code, SSL_REQUEST_CODE, "expected the SSLRequest code");

    stream.write_all(&[reply_byte]).expect("write ssl reply");
}

/// Drain the StartupMessage (already known to have no type byte).
pub fn drain_startup(stream: &mut TcpStream) {
    drain_one_length_prefixed_frame(stream, false);
}

/// Drain one frontend message (type byte + length-prefixed payload),
/// ignoring its contents; used when a test script doesn't need to inspect
/// what the client sent, only that it sent something before the next
/// scripted reply.
pub fn drain_one_message(stream: &mut TcpStream) -> Vec<u8> {
    drain_one_length_prefixed_frame(stream, true)
}

/// Spawn a scripted server on an ephemeral loopback port, running `script`
/// in a background thread. Returns the bound port and the join handle.
pub fn spawn_server<F>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let port = listener.local_addr().expect("local addr").port();

    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept connection");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("set read timeout");
        script(stream);
    });

    (port, handle)
}

/// Like [`spawn_server`] but accepts two connections in sequence, handing
/// each to its own callback — used by the cancellation scenario, where the
/// cancel request arrives on a second, independent connection.
pub fn spawn_server_two_conns<F, G>(first: F, second: G) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
    G: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let port = listener.local_addr().expect("local addr").port();

    let handle = std::thread::spawn(move || {
        let (stream1, _) = listener.accept().expect("accept first connection");
        stream1
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("set read timeout");
        first(stream1);

        let (stream2, _) = listener.accept().expect("accept second connection");
        stream2
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("set read timeout");
        second(stream2);
    });

    (port, handle)
}

pub fn base_opts(port: u16) -> pg_core_driver::Opts {
    pg_core_driver::Opts {
        host: "127.0.0.1".to_string(),
        port,
        user: "tester".to_string(),
        timeout: Duration::from_secs(5),
        ssl_mode: pg_core_driver::SslMode::Disable,
        ..Default::default()
    }
}

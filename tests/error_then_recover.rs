//! S5: a server error mid-query surfaces to the caller, and the connector
//! is usable again once its ReadyForQuery arrives (spec.md §8).

mod common;

use std::io::Write;

use pg_core_driver::{Connector, ConnectorState, Message};

#[test]
fn error_response_then_ready_for_query_allows_a_new_query() {
    let (port, server) = common::spawn_server(|mut stream| {
        common::drain_startup(&mut stream);

        let mut reply = Vec::new();
        reply.extend(common::authentication_ok());
        reply.extend(common::backend_key_data(5, 6));
        reply.extend(common::parameter_status("server_version", "14.2"));
        reply.extend(common::ready_for_query(b'I'));
        stream.write_all(&reply).expect("write startup reply");
        stream.flush().expect("flush startup reply");

        common::drain_one_message(&mut stream); // the bad query

        let mut reply = Vec::new();
        reply.extend(common::error_response("ERROR", "42601", "syntax error"));
        reply.extend(common::ready_for_query(b'I'));
        stream.write_all(&reply).expect("write error reply");
        stream.flush().expect("flush error reply");

        common::drain_one_message(&mut stream); // SELECT 1

        let mut reply = Vec::new();
        reply.extend(common::row_description_one_col("?column?"));
        reply.extend(common::data_row_int4(1));
        reply.extend(common::command_complete("SELECT 1"));
        reply.extend(common::ready_for_query(b'I'));
        stream.write_all(&reply).expect("write query reply");
        stream.flush().expect("flush query reply");
    });

    let opts = common::base_opts(port);
    let mut conn = Connector::open(&opts).expect("open");

    conn.add_query("NOT VALID SQL").expect("add_query");
    conn.send_all().expect("send_all");

    let err = loop {
        match conn.read_single() {
            Err(e) => break e,
            Ok(Some(other)) => panic!("expected an error, got {other:?}"),
            Ok(None) => continue,
        }
    };
    assert_eq!(err.sqlstate(), Some("42601"));

    // The server error is buffered and surfaced only once its trailing
    // ReadyForQuery has been read, so the connector is already Ready again
    // by the time the caller sees the error — no separate drain needed.
    assert_eq!(conn.state(), ConnectorState::Ready);

    conn.add_query("SELECT 1").expect("add_query after recovery");
    conn.send_all().expect("send_all");

    let mut saw_command_complete = false;
    loop {
        match conn.read_single().expect("read_single") {
            Some(Message::CommandComplete(cc)) => {
                assert_eq!(cc.tag, "SELECT 1");
                saw_command_complete = true;
            }
            Some(Message::ReadyForQuery(_)) => break,
            Some(_) => continue,
            None => continue,
        }
    }
    assert!(saw_command_complete);

    conn.close().expect("close");
    server.join().expect("server thread");
}

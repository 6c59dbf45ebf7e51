//! S6: cancellation opens a fresh side connection and writes exactly one
//! 16-byte CancelRequest packet, without touching the original connector's
//! state machine (spec.md §8).

mod common;

use std::io::{Read, Write};
use std::time::Duration;

use pg_core_driver::{Connector, ConnectorState};

#[test]
fn cancel_request_sends_one_packet_on_a_side_connection() {
    let (port, server) = common::spawn_server_two_conns(
        |mut stream| {
            common::drain_startup(&mut stream);

            let mut reply = Vec::new();
            reply.extend(common::authentication_ok());
            reply.extend(common::backend_key_data(123, 456));
            reply.extend(common::parameter_status("server_version", "13.1"));
            reply.extend(common::ready_for_query(b'I'));
            stream.write_all(&reply).expect("write startup reply");
            stream.flush().expect("flush startup reply");

            // Leave the query in flight: the real server response is never
            // sent, mimicking a long-running query at the moment of
            // cancellation. The test drops this connection once the second
            // one has been serviced.
            common::drain_one_message(&mut stream); // the long-running query
        },
        |mut stream| {
            let mut packet = [0u8; 16];
            stream.read_exact(&mut packet).expect("read cancel packet");

            const CANCEL_REQUEST_CODE: i32 = 80877102;
            let len = i32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
            let code = i32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
            let pid = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
            let secret = u32::from_be_bytes([packet[12], packet[13], packet[14], packet[15]]);

            assert_eq!(len, 16);
            assert_eq!(code, CANCEL_REQUEST_CODE);
            assert_eq!(pid, 123);
            assert_eq!(secret, 456);

            // Real servers close the connection without replying.
            assert_eq!(stream.read(&mut [0u8; 1]).unwrap_or(0), 0);
        },
    );

    let opts = common::base_opts(port);
    let mut conn = Connector::open(&opts).expect("open");

    let (pid, secret) = conn.backend_key().expect("backend key");

    conn.add_query("SELECT pg_sleep(60)").expect("add_query");
    conn.send_all().expect("send_all");
    assert_eq!(conn.state(), ConnectorState::Executing);

    Connector::cancel_request(&opts.host, opts.port, Duration::from_secs(5), pid, secret)
        .expect("cancel_request");

    // The call to cancel_request must not have mutated the original
    // connector's state machine.
    assert_eq!(conn.state(), ConnectorState::Executing);

    server.join().expect("server thread");
}

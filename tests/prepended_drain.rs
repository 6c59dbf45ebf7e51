//! S3/S4: prepended setup statements drain invisibly, and a Pending
//! transaction status survives an unrelated Idle RFQ racing ahead of the
//! real one (spec.md §8). The finer-grained, white-box version of this
//! behavior (manipulating `sent_rfq_prepended` directly) lives in
//! `src/connector.rs`'s own test module; this is the same invariant
//! exercised end to end through the public API.

mod common;

use std::io::Write;

use pg_core_driver::{Connector, ConnectorState, Message, TransactionStatus};

#[test]
fn begin_prepend_drains_before_the_real_reply_and_status_updates_along_the_way() {
    let (port, server) = common::spawn_server(|mut stream| {
        common::drain_startup(&mut stream);

        let mut reply = Vec::new();
        reply.extend(common::authentication_ok());
        reply.extend(common::backend_key_data(7, 8));
        reply.extend(common::parameter_status("server_version", "13.1"));
        reply.extend(common::ready_for_query(b'I'));
        stream.write_all(&reply).expect("write startup reply");
        stream.flush().expect("flush startup reply");

        // reset() doesn't flush: DISCARD ALL only sits prepended (ROLLBACK
        // is skipped, not in a transaction yet) until begin()+add_query()'s
        // send_all carries it through in the same round trip as BEGIN and
        // the real query.
        common::drain_one_message(&mut stream); // DISCARD ALL
        common::drain_one_message(&mut stream); // BEGIN
        common::drain_one_message(&mut stream); // SELECT 1

        let mut reply = Vec::new();
        reply.extend(common::ready_for_query(b'I')); // DISCARD ALL's RFQ, hidden
        reply.extend(common::ready_for_query(b'T')); // BEGIN's RFQ, hidden
        reply.extend(common::row_description_one_col("?column?"));
        reply.extend(common::data_row_int4(1));
        reply.extend(common::command_complete("SELECT 1"));
        reply.extend(common::ready_for_query(b'T')); // the real, visible RFQ
        stream.write_all(&reply).expect("write query reply");
        stream.flush().expect("flush query reply");
    });

    let opts = common::base_opts(port);
    let mut conn = Connector::open(&opts).expect("open");

    conn.reset().expect("reset");
    assert_eq!(conn.state(), ConnectorState::Ready);
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

    conn.begin().expect("begin");
    assert_eq!(conn.transaction_status(), TransactionStatus::Pending);

    conn.add_query("SELECT 1").expect("add_query");
    conn.send_all().expect("send_all");

    let mut saw_real_rfq = false;
    loop {
        match conn.read_single().expect("read_single") {
            // The DISCARD ALL and BEGIN RFQs must never surface to the
            // caller, but each still updates transaction status along the
            // way.
            None => continue,
            Some(Message::ReadyForQuery(status)) => {
                assert_eq!(status, TransactionStatus::InTransactionBlock);
                saw_real_rfq = true;
                break;
            }
            Some(_) => continue,
        }
    }
    assert_eq!(conn.transaction_status(), TransactionStatus::InTransactionBlock);
    assert!(saw_real_rfq);

    conn.close().expect("close");
    server.join().expect("server thread");
}

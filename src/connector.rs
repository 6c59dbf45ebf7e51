//! The core Connector state machine: opens the session, owns connector
//! state, pumps messages, dispatches async chatter, and tracks transaction
//! status, prepended setup messages, and cancellation/reset/close.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::auth::{self, SaslProvider};
use crate::buffer::FramedBuffer;
use crate::error::{Error, Result};
use crate::feature::ServerFeatures;
use crate::notify::{self, NotificationHandler};
use crate::opts::Opts;
use crate::protocol::backend::{
    self, BackendKeyData, CommandComplete, CopyData, CopyInResponse, CopyOutResponse, DataRow,
    ErrorResponse, NegotiateProtocolVersion, NoticeResponse, NotificationResponse,
    ParameterDescription, ParameterStatus, ReadyForQuery, RowDescription,
};
use crate::protocol::frontend;
use crate::protocol::types::{FormatCode, TransactionIndicator};
use crate::transport::{self, Stream};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`Connector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Never opened, or closed/terminated.
    Closed,
    /// Startup/authentication dialog in progress.
    Connecting,
    /// Idle between requests, ready to accept a new one.
    Ready,
    /// Simple or extended query in flight, awaiting completion.
    Executing,
    /// Extended-query Execute with a row limit is suspended mid-portal.
    Fetching,
    /// COPY IN/OUT/BOTH in progress.
    Copy,
    /// The connection is unusable and must be discarded.
    Broken,
}

/// Client-tracked transaction status.
///
/// `Pending` is never sent by the server: it is set the moment the
/// Connector prepends a `BEGIN` it hasn't transmitted yet, so that callers
/// checking `in_transaction()` between `prepend` and `send_all` observe the
/// state the transaction is *about* to be in. A prepended drain's
/// ReadyForQuery (see [`Connector::pending_rfq_prepended`]) never updates
/// this field, so `Pending` cannot be clobbered back to `Idle` by an
/// unrelated setup message's reply racing ahead of the real one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransactionBlock,
    InFailedTransactionBlock,
    Pending,
}

impl TransactionStatus {
    pub fn in_transaction(&self) -> bool {
        matches!(
            self,
            Self::InTransactionBlock | Self::InFailedTransactionBlock | Self::Pending
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::InFailedTransactionBlock)
    }

    pub(crate) fn from_indicator(indicator: TransactionIndicator) -> Self {
        match indicator {
            TransactionIndicator::Idle => Self::Idle,
            TransactionIndicator::InTransaction => Self::InTransactionBlock,
            TransactionIndicator::Failed => Self::InFailedTransactionBlock,
        }
    }
}

/// A decoded backend message surfaced to the caller after the Connector's
/// dispatcher has consumed every message it owns (ParameterStatus,
/// NoticeResponse, NotificationResponse, and prepended-drain
/// ReadyForQuery replies never reach here).
#[derive(Debug)]
pub enum Message<'a> {
    RowDescription(RowDescription<'a>),
    DataRow(DataRow<'a>),
    CommandComplete(CommandComplete<'a>),
    EmptyQueryResponse,
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription(ParameterDescription),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    CopyData(CopyData<'a>),
    CopyDone,
    ReadyForQuery(TransactionStatus),
}

/// The core PostgreSQL session state machine, generic over any
/// `Read + Write` transport (sync TCP/TLS today; the `tokio` module mirrors
/// this over an async transport).
pub struct Connector<S> {
    buf: FramedBuffer<S>,
    state: ConnectorState,
    tx_status: TransactionStatus,
    backend_key: Option<(u32, u32)>,
    params: HashMap<String, String>,
    features: ServerFeatures,
    pending_rfq_prepended: usize,
    sent_rfq_prepended: usize,
    conn_id: u64,
    command_timeout: Option<Duration>,
    active_statement_timeout: Option<Duration>,
    notification_handler: Option<Box<dyn NotificationHandler>>,
    is_secure: bool,
    /// An ErrorResponse seen mid-request, held until its trailing
    /// ReadyForQuery arrives (spec §7.3: "buffered and thrown when the
    /// trailing RFQ is received; connector remains Ready").
    pending_server_error: Option<Error>,
}

impl<S: Read + Write> Connector<S> {
    /// Drive the startup sequence to completion on an already-connected
    /// (and, if applicable, already TLS-upgraded) stream.
    fn open_on_stream(stream: S, opts: &Opts, buffer_size: usize) -> Result<Self> {
        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::debug_span!("connector_open", conn_id);
        let _enter = span.enter();

        let mut buf = FramedBuffer::new(stream, buffer_size);

        let mut params_out = Vec::new();
        params_out.push(("user".to_string(), opts.user.clone()));
        if let Some(db) = &opts.database {
            params_out.push(("database".to_string(), db.clone()));
        }
        if let Some(app) = &opts.application_name {
            params_out.push(("application_name".to_string(), app.clone()));
        }
        for (k, v) in &opts.params {
            params_out.push((k.clone(), v.clone()));
        }
        let params_ref: Vec<(&str, &str)> = params_out
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        frontend::write_startup(buf.buffer_mut(), &params_ref);
        buf.flush()?;

        auth::authenticate(&mut buf, &opts.user, opts.password.as_deref(), None)?;

        let mut params = HashMap::new();
        let mut backend_key = None;
        let server_version;

        loop {
            let ready = {
                let msg = buf.read_message()?;
                match msg.type_byte {
                    t if t == backend::msg_type::PARAMETER_STATUS => {
                        let ps = ParameterStatus::parse(msg.payload)?;
                        params.insert(ps.name.to_string(), ps.value.to_string());
                        false
                    }
                    t if t == backend::msg_type::BACKEND_KEY_DATA => {
                        let key = BackendKeyData::parse(msg.payload)?;
                        backend_key = Some((key.process_id(), key.secret()));
                        false
                    }
                    t if t == backend::msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                        let neg = NegotiateProtocolVersion::parse(msg.payload)?;
                        tracing::warn!(
                            conn_id,
                            newest_minor = neg.newest_minor_version,
                            "server does not support all requested protocol options"
                        );
                        false
                    }
                    t if t == backend::msg_type::NOTICE_RESPONSE => {
                        let notice = NoticeResponse::parse(msg.payload)?;
                        tracing::warn!(
                            conn_id,
                            message = notice.message().unwrap_or_default(),
                            "startup notice"
                        );
                        false
                    }
                    t if t == backend::msg_type::ERROR_RESPONSE => {
                        return Err(ErrorResponse::parse(msg.payload)?.into_error());
                    }
                    t if t == backend::msg_type::READY_FOR_QUERY => {
                        ReadyForQuery::parse(msg.payload)?
                            .transaction_status()
                            .ok_or_else(|| Error::Protocol("invalid transaction status byte".into()))?;
                        true
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected message type '{}' during startup",
                            other as char
                        )));
                    }
                }
            };

            if ready {
                break;
            }
        }

        server_version = params
            .get("server_version")
            .cloned()
            .unwrap_or_default();
        let mut features = ServerFeatures::from_server_version(&server_version);
        if let Some(value) = params.get("standard_conforming_strings") {
            features.set_standard_conforming_strings(value);
        }

        tracing::debug!(conn_id, server_version, "connector ready");

        Ok(Self {
            buf,
            state: ConnectorState::Ready,
            tx_status: TransactionStatus::Idle,
            backend_key,
            params,
            features,
            pending_rfq_prepended: 0,
            sent_rfq_prepended: 0,
            conn_id,
            command_timeout: opts.command_timeout,
            active_statement_timeout: None,
            notification_handler: None,
            is_secure: false,
            pending_server_error: None,
        })
    }

    /// Register a callback for NotificationResponse (and NoticeResponse)
    /// messages. A handler that panics is isolated (see [`crate::notify`]).
    pub fn set_notification_handler(&mut self, handler: impl NotificationHandler + 'static) {
        self.notification_handler = Some(Box::new(handler));
    }

    /// Current connector state.
    pub fn state(&self) -> ConnectorState {
        self.state
    }

    /// Current client-tracked transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// The backend process id and secret key, for [`cancel_request`].
    pub fn backend_key(&self) -> Option<(u32, u32)> {
        self.backend_key
    }

    /// Server capability flags derived from `server_version`.
    pub fn features(&self) -> ServerFeatures {
        self.features
    }

    /// Look up a reported server parameter (e.g. `"server_version"`,
    /// `"client_encoding"`, `"TimeZone"`).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    /// Whether the transport is TLS-wrapped. `false` for a plain-TCP
    /// session, including one opened with `sslmode=Prefer` against a
    /// server that declined the upgrade.
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    fn require_ready(&self) -> Result<()> {
        match self.state {
            ConnectorState::Ready => Ok(()),
            ConnectorState::Broken => Err(Error::ConnectionBroken),
            other => Err(Error::InvalidUsage(format!(
                "cannot start a new request while connector is in state {other:?}"
            ))),
        }
    }

    /// Queue a setup message (ROLLBACK, DISCARD ALL, UNLISTEN *, SET
    /// statement_timeout, ...) ahead of the caller's own request. Its
    /// ReadyForQuery reply is drained silently once sent; see
    /// [`Self::send_all`].
    fn prepend_simple_query(&mut self, sql: &str) {
        frontend::write_query(self.buf.buffer_mut(), sql);
        self.pending_rfq_prepended += 1;
    }

    /// Prepend a `BEGIN` ahead of the caller's next request and mark the
    /// transaction status `Pending` immediately, so `transaction_status()`
    /// reflects the transaction the connector is *about* to be in even
    /// before the BEGIN reaches the wire (spec §3, `TransactionStatus`).
    pub fn begin(&mut self) -> Result<()> {
        self.require_ready()?;
        self.prepend_simple_query("BEGIN");
        self.tx_status = TransactionStatus::Pending;
        Ok(())
    }

    /// Apply a ReadyForQuery's transaction-status indicator, honoring the
    /// `Pending` edge case: an `Idle` reply arriving while a prepended
    /// `BEGIN`'s own reply is still in flight must not clear `Pending` (spec
    /// §3, §4.5 transaction tracking; invariant 6 in spec §8).
    fn update_transaction_status(&mut self, new: TransactionStatus) {
        if new == self.tx_status {
            return;
        }
        match new {
            TransactionStatus::Idle if self.tx_status == TransactionStatus::Pending => {}
            _ => self.tx_status = new,
        }
    }

    /// Prepend the setup messages a pool would want before handing this
    /// connector back out, or before starting a fresh top-level request:
    /// roll back any open transaction, discard session state, and drop any
    /// stray LISTEN registrations. Does not flush — the next `send_all`
    /// (from the caller's own next request, or a standalone one) carries
    /// these through the ordinary prepended-drain path (spec §4.5: "Does
    /// not flush; the next real operation will flush them transparently").
    pub fn reset(&mut self) -> Result<()> {
        self.require_ready()?;

        if self.tx_status.in_transaction() {
            // Left as-is rather than set optimistically: ROLLBACK's own
            // hidden ReadyForQuery is what actually resolves this to Idle
            // once drained (unlike `begin`'s `Pending`, there's no later
            // "real" status this needs to hold a placeholder for).
            self.prepend_simple_query("ROLLBACK");
        }
        if self.features.supports_discard {
            self.prepend_simple_query("DISCARD ALL");
        } else {
            self.prepend_simple_query("UNLISTEN *");
        }
        Ok(())
    }

    /// Apply (or clear) a per-command statement timeout by prepending a
    /// `SET statement_timeout` ahead of the next request, but only when it
    /// differs from the timeout already in effect — avoids a round-trip on
    /// every single query when the caller's timeout hasn't changed.
    fn maybe_prepend_statement_timeout(&mut self, wanted: Option<Duration>) {
        if wanted == self.active_statement_timeout {
            return;
        }
        let millis = wanted.map(|d| d.as_millis()).unwrap_or(0);
        self.prepend_simple_query(&format!("SET statement_timeout = {millis}"));
        self.active_statement_timeout = wanted;
    }

    /// Encode a simple-protocol Query message, applying the configured
    /// `command_timeout` as a prepended `SET statement_timeout` when needed.
    pub fn add_query(&mut self, sql: &str) -> Result<()> {
        self.require_ready()?;
        let timeout = self.command_timeout;
        self.maybe_prepend_statement_timeout(timeout);
        frontend::write_query(self.buf.buffer_mut(), sql);
        self.state = ConnectorState::Executing;
        Ok(())
    }

    /// Encode a Parse/Bind/Describe/Execute/Sync batch for the extended
    /// query protocol. Parameters are pre-encoded by the caller (the
    /// type-handler registry lives above this crate).
    #[allow(clippy::too_many_arguments)]
    pub fn add_extended_query(
        &mut self,
        statement_name: &str,
        portal_name: &str,
        sql: &str,
        param_oids: &[u32],
        param_formats: &[FormatCode],
        params: &[Option<&[u8]>],
        result_formats: &[FormatCode],
        max_rows: u32,
    ) -> Result<()> {
        self.require_ready()?;
        let timeout = self.command_timeout;
        self.maybe_prepend_statement_timeout(timeout);

        frontend::write_parse(self.buf.buffer_mut(), statement_name, sql, param_oids);
        frontend::write_bind(
            self.buf.buffer_mut(),
            portal_name,
            statement_name,
            param_formats,
            params,
            result_formats,
        );
        frontend::write_describe_portal(self.buf.buffer_mut(), portal_name);
        frontend::write_execute(self.buf.buffer_mut(), portal_name, max_rows);
        frontend::write_sync(self.buf.buffer_mut());
        self.state = ConnectorState::Executing;
        Ok(())
    }

    /// Flush every queued frontend message, converting
    /// `pending_rfq_prepended` into `sent_rfq_prepended` — once this returns,
    /// the connector knows exactly how many ReadyForQuery replies the wire
    /// owes it before the caller's own reply arrives.
    pub fn send_all(&mut self) -> Result<()> {
        self.buf.flush()?;
        self.sent_rfq_prepended += self.pending_rfq_prepended;
        self.pending_rfq_prepended = 0;
        Ok(())
    }

    /// Silently read and discard messages belonging to already-sent
    /// prepended setup queries, stopping once all their ReadyForQuery
    /// replies have been consumed.
    fn drain_prepended(&mut self) -> Result<()> {
        while self.sent_rfq_prepended > 0 {
            self.read_single()?;
        }
        Ok(())
    }

    /// Read and dispatch one backend message, transparently consuming
    /// ParameterStatus/NoticeResponse/NotificationResponse and prepended
    /// ReadyForQuery drains. Returns `Ok(None)` when the message was fully
    /// absorbed by the dispatcher and the caller should call again.
    pub fn read_single(&mut self) -> Result<Option<Message<'_>>> {
        if self.state == ConnectorState::Broken {
            return Err(Error::ConnectionBroken);
        }

        let result = self.read_single_inner();
        if let Err(ref e) = result {
            if e.is_connection_broken() {
                self.state = ConnectorState::Broken;
                tracing::error!(conn_id = self.conn_id, "connector broken: {e}");
            }
        }
        result
    }

    fn read_single_inner(&mut self) -> Result<Option<Message<'_>>> {
        let msg = self.buf.read_message()?;
        let type_byte = msg.type_byte;
        let payload_ptr = msg.payload.as_ptr();
        let payload_len = msg.payload.len();
        // SAFETY: the payload slice borrows `self.buf`'s read buffer, which
        // is not touched again until the match below calls into `self.buf`
        // only through methods that don't reallocate (`parameter`/logging);
        // reconstructing the slice lets us drop `msg`'s borrow before the
        // final match arm needs `&mut self` for bookkeeping.
        let payload: &[u8] =
            unsafe { std::slice::from_raw_parts(payload_ptr, payload_len) };

        match type_byte {
            t if t == backend::msg_type::PARAMETER_STATUS => {
                let ps = ParameterStatus::parse(payload)?;
                if ps.name == "standard_conforming_strings" {
                    self.features.set_standard_conforming_strings(&ps.value);
                }
                self.params.insert(ps.name.to_string(), ps.value.to_string());
                Ok(None)
            }
            t if t == backend::msg_type::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(payload)?;
                tracing::warn!(
                    conn_id = self.conn_id,
                    message = notice.message().unwrap_or_default(),
                    "notice"
                );
                if let Some(handler) = self.notification_handler.as_deref_mut() {
                    notify::dispatch_notice(handler, &notice);
                }
                Ok(None)
            }
            t if t == backend::msg_type::NOTIFICATION_RESPONSE => {
                let notification = NotificationResponse::parse(payload)?;
                tracing::debug!(
                    conn_id = self.conn_id,
                    channel = notification.channel,
                    "notification"
                );
                if let Some(handler) = self.notification_handler.as_deref_mut() {
                    notify::dispatch_notification(handler, &notification);
                }
                Ok(None)
            }
            t if t == backend::msg_type::ERROR_RESPONSE => {
                let err = ErrorResponse::parse(payload)?;
                let severity = err.severity().unwrap_or_default().to_string();
                if self.sent_rfq_prepended > 0 {
                    // An error inside a prepended setup message still owes
                    // us its ReadyForQuery before the session is usable
                    // again, but the failure itself is real and must not be
                    // swallowed.
                    tracing::error!(conn_id = self.conn_id, severity, "prepended setup failed");
                } else {
                    tracing::warn!(conn_id = self.conn_id, severity, "server error");
                }
                // Buffer rather than return immediately: the server still
                // owes a ReadyForQuery for this request, and the connector
                // must not be surfaced to the caller (or marked Ready) until
                // that RFQ is actually drained (spec §7.3).
                self.pending_server_error = Some(err.into_error());
                Ok(None)
            }
            t if t == backend::msg_type::READY_FOR_QUERY => {
                let rfq = ReadyForQuery::parse(payload)?;
                let indicator = rfq
                    .transaction_status()
                    .ok_or_else(|| Error::Protocol("invalid transaction status byte".into()))?;

                // Every RFQ updates transaction status, including ones
                // belonging to a prepended setup message being drained: a
                // BEGIN prepended alongside DISCARD ALL owes its own status
                // update even though its RFQ is invisible to the caller.
                self.update_transaction_status(TransactionStatus::from_indicator(indicator));

                if self.sent_rfq_prepended > 0 {
                    self.sent_rfq_prepended -= 1;
                    return Ok(None);
                }

                self.state = ConnectorState::Ready;
                if let Some(error) = self.pending_server_error.take() {
                    return Err(error);
                }
                Ok(Some(Message::ReadyForQuery(self.tx_status)))
            }
            t if t == backend::msg_type::ROW_DESCRIPTION => {
                Ok(Some(Message::RowDescription(RowDescription::parse(payload)?)))
            }
            t if t == backend::msg_type::DATA_ROW => {
                Ok(Some(Message::DataRow(DataRow::parse(payload)?)))
            }
            t if t == backend::msg_type::COMMAND_COMPLETE => Ok(Some(Message::CommandComplete(
                CommandComplete::parse(payload)?,
            ))),
            t if t == backend::msg_type::EMPTY_QUERY_RESPONSE => {
                Ok(Some(Message::EmptyQueryResponse))
            }
            t if t == backend::msg_type::PARSE_COMPLETE => Ok(Some(Message::ParseComplete)),
            t if t == backend::msg_type::BIND_COMPLETE => Ok(Some(Message::BindComplete)),
            t if t == backend::msg_type::CLOSE_COMPLETE => Ok(Some(Message::CloseComplete)),
            t if t == backend::msg_type::NO_DATA => Ok(Some(Message::NoData)),
            t if t == backend::msg_type::PORTAL_SUSPENDED => {
                self.state = ConnectorState::Fetching;
                Ok(Some(Message::PortalSuspended))
            }
            t if t == backend::msg_type::PARAMETER_DESCRIPTION => Ok(Some(
                Message::ParameterDescription(ParameterDescription::parse(payload)?),
            )),
            t if t == backend::msg_type::COPY_IN_RESPONSE => {
                self.state = ConnectorState::Copy;
                Ok(Some(Message::CopyInResponse(CopyInResponse::parse(payload)?)))
            }
            t if t == backend::msg_type::COPY_OUT_RESPONSE => {
                self.state = ConnectorState::Copy;
                Ok(Some(Message::CopyOutResponse(CopyOutResponse::parse(
                    payload,
                )?)))
            }
            t if t == backend::msg_type::COPY_DATA => {
                Ok(Some(Message::CopyData(CopyData::parse(payload)?)))
            }
            t if t == backend::msg_type::COPY_DONE => Ok(Some(Message::CopyDone)),
            other => Err(Error::Protocol(format!(
                "unexpected message type '{}'",
                other as char
            ))),
        }
    }

    /// Send CopyData during a COPY IN. Payloads too large to fit in the
    /// remaining write-buffer headroom are framed by hand and written
    /// straight to the stream, bypassing the buffer copy.
    pub fn copy_data(&mut self, data: &[u8]) -> Result<()> {
        if self.state != ConnectorState::Copy {
            return Err(Error::InvalidUsage("not in a COPY operation".into()));
        }
        if data.len() > self.buf.write_space_left() {
            let mut header = Vec::with_capacity(5);
            header.push(frontend::msg_type::COPY_DATA);
            header.extend_from_slice(&((data.len() + 4) as i32).to_be_bytes());
            self.buf.write_direct(&header)?;
            self.buf.write_direct(data)?;
            Ok(())
        } else {
            frontend::write_copy_data(self.buf.buffer_mut(), data);
            Ok(())
        }
    }

    /// Signal normal completion of a COPY IN.
    pub fn copy_done(&mut self) -> Result<()> {
        frontend::write_copy_done(self.buf.buffer_mut());
        frontend::write_sync(self.buf.buffer_mut());
        self.send_all()
    }

    /// Abort a COPY IN with an error message sent to the server.
    pub fn copy_fail(&mut self, message: &str) -> Result<()> {
        frontend::write_copy_fail(self.buf.buffer_mut(), message);
        frontend::write_sync(self.buf.buffer_mut());
        self.send_all()
    }

    /// Close the connection gracefully with a Terminate message.
    pub fn close(mut self) -> Result<()> {
        if self.state == ConnectorState::Broken {
            return Ok(());
        }
        frontend::write_terminate(self.buf.buffer_mut());
        self.buf.flush()?;
        self.state = ConnectorState::Closed;
        Ok(())
    }

    /// Mark the connection unusable without attempting any further I/O
    /// (used after an unrecoverable transport error).
    pub fn break_connection(&mut self) {
        self.state = ConnectorState::Broken;
    }
}

impl Connector<Stream> {
    /// Open a synchronous connection to a PostgreSQL server, performing DNS
    /// resolution, TCP connect, optional in-band TLS upgrade, and the full
    /// startup/authentication dialog.
    pub fn open(opts: &Opts) -> Result<Self> {
        let mut stream = transport::raw_open(&opts.host, opts.port, opts.timeout)?;

        if transport::ssl_attempted(opts.ssl_mode) {
            let mut negotiate_buf = Vec::new();
            frontend::write_ssl_request(&mut negotiate_buf);
            stream.write_all(&negotiate_buf)?;
            stream.flush()?;

            let mut reply = [0u8; 1];
            stream.read_exact(&mut reply)?;

            match reply[0] {
                b'S' => {
                    #[cfg(feature = "sync-tls")]
                    {
                        stream = stream.upgrade_to_tls(&opts.host)?;
                    }
                    #[cfg(not(feature = "sync-tls"))]
                    {
                        return Err(Error::Unsupported(
                            "server accepted TLS but the sync-tls feature is not enabled".into(),
                        ));
                    }
                }
                b'N' => {
                    if transport::ssl_required(opts.ssl_mode) {
                        return Err(Error::Auth(
                            "server refused SSL but sslmode=require was requested".into(),
                        ));
                    }
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected SSLRequest reply byte: {other}"
                    )));
                }
            }
        }

        let is_secure = stream.is_tls();
        let mut connector = Self::open_on_stream(stream, opts, opts.buffer_size)?;
        connector.is_secure = is_secure;

        if let Some(search_path) = &opts.search_path {
            connector.add_query(&format!("SET search_path TO {search_path}"))?;
            connector.send_all()?;
            loop {
                match connector.read_single()? {
                    Some(Message::ReadyForQuery(_)) => break,
                    Some(_) => continue,
                    None => continue,
                }
            }
        }

        Ok(connector)
    }

    /// Open a side-channel connection and issue a CancelRequest for the
    /// query currently running on the connector identified by
    /// `(backend_pid, backend_secret)`. The server closes this connection
    /// immediately with no reply, matching the protocol's design.
    pub fn cancel_request(
        host: &str,
        port: u16,
        timeout: Duration,
        backend_pid: u32,
        backend_secret: u32,
    ) -> Result<()> {
        let mut stream = transport::raw_open(host, port, timeout)?;
        let mut buf = Vec::new();
        frontend::write_cancel_request(&mut buf, backend_pid, backend_secret);
        stream.write_all(&buf)?;
        stream.flush()?;
        Ok(())
    }
}

/// Use a configured [`SaslProvider`] (GSS/SSPI) instead of a password during
/// [`Connector::open`]. Exposed as a free function since the provider is
/// only needed for the brief authentication window.
pub fn authenticate_with_provider<S: Read + Write>(
    buf: &mut FramedBuffer<S>,
    user: &str,
    provider: &mut dyn SaslProvider,
) -> Result<()> {
    auth::authenticate(buf, user, None, Some(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_status_in_transaction() {
        assert!(!TransactionStatus::Idle.in_transaction());
        assert!(TransactionStatus::InTransactionBlock.in_transaction());
        assert!(TransactionStatus::InFailedTransactionBlock.in_transaction());
        assert!(TransactionStatus::Pending.in_transaction());
    }

    #[test]
    fn transaction_status_is_failed() {
        assert!(TransactionStatus::InFailedTransactionBlock.is_failed());
        assert!(!TransactionStatus::InTransactionBlock.is_failed());
    }

    #[test]
    fn from_indicator_maps_correctly() {
        assert_eq!(
            TransactionStatus::from_indicator(TransactionIndicator::Idle),
            TransactionStatus::Idle
        );
        assert_eq!(
            TransactionStatus::from_indicator(TransactionIndicator::InTransaction),
            TransactionStatus::InTransactionBlock
        );
        assert_eq!(
            TransactionStatus::from_indicator(TransactionIndicator::Failed),
            TransactionStatus::InFailedTransactionBlock
        );
    }

    fn test_connector(script: Vec<u8>) -> Connector<std::io::Cursor<Vec<u8>>> {
        Connector {
            buf: FramedBuffer::new(std::io::Cursor::new(script), 256),
            state: ConnectorState::Ready,
            tx_status: TransactionStatus::Idle,
            backend_key: None,
            params: HashMap::new(),
            features: ServerFeatures::default(),
            pending_rfq_prepended: 0,
            sent_rfq_prepended: 0,
            conn_id: 0,
            command_timeout: None,
            active_statement_timeout: None,
            notification_handler: None,
            is_secure: false,
            pending_server_error: None,
        }
    }

    fn rfq_bytes(status: u8) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(backend::msg_type::READY_FOR_QUERY);
        out.extend_from_slice(&5i32.to_be_bytes());
        out.push(status);
        out
    }

    #[test]
    fn idle_while_pending_is_ignored() {
        let mut conn = test_connector(rfq_bytes(b'I'));
        conn.tx_status = TransactionStatus::Pending;
        conn.sent_rfq_prepended = 1;
        conn.read_single().unwrap();
        assert_eq!(conn.transaction_status(), TransactionStatus::Pending);
    }

    #[test]
    fn begin_then_real_rfq_observes_intransaction() {
        let mut script = rfq_bytes(b'I'); // DISCARD ALL's RFQ
        script.extend(rfq_bytes(b'T')); // BEGIN's RFQ
        script.extend(rfq_bytes(b'T')); // the user's real RFQ

        let mut conn = test_connector(script);
        conn.tx_status = TransactionStatus::Pending;
        conn.sent_rfq_prepended = 2;

        // First RFQ (DISCARD ALL): Idle while Pending is ignored and hidden.
        assert!(conn.read_single().unwrap().is_none());
        assert_eq!(conn.transaction_status(), TransactionStatus::Pending);

        // Second RFQ (BEGIN): status flips to InTransactionBlock, still hidden.
        assert!(conn.read_single().unwrap().is_none());
        assert_eq!(
            conn.transaction_status(),
            TransactionStatus::InTransactionBlock
        );

        // Third RFQ: the real, observable one.
        match conn.read_single().unwrap() {
            Some(Message::ReadyForQuery(status)) => {
                assert_eq!(status, TransactionStatus::InTransactionBlock)
            }
            other => panic!("expected ReadyForQuery, got {other:?}"),
        }
    }

    #[test]
    fn begin_sets_pending_before_send() {
        let mut conn = test_connector(Vec::new());
        conn.begin().unwrap();
        assert_eq!(conn.transaction_status(), TransactionStatus::Pending);
    }
}

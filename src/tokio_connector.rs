//! Asynchronous twin of [`crate::connector::Connector`], built on `tokio`.
//!
//! The algorithms and message ordering are identical to the sync core (spec
//! §5: "Cooperative asynchronous variants of send and read are provided;
//! each blocking entry point has an async twin"). This module does not add
//! a scheduler or a pool — it is a single connector, driven by whichever
//! task happens to own it, exactly like the sync `Connector` is driven by
//! whichever thread owns it.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::Instant as TokioInstant;

use crate::auth::SaslProvider;
use crate::connector::{ConnectorState, Message, TransactionStatus};
use crate::error::{Error, Result};
use crate::feature::ServerFeatures;
use crate::notify::{self, NotificationHandler};
use crate::opts::Opts;
use crate::protocol::backend::{
    self, BackendKeyData, CommandComplete, CopyData, CopyInResponse, CopyOutResponse, DataRow,
    ErrorResponse, NegotiateProtocolVersion, NoticeResponse, NotificationResponse,
    ParameterDescription, ParameterStatus, ReadyForQuery, RowDescription,
};
use crate::protocol::frontend::{self, md5_password, write_gss_response, write_password};
use crate::protocol::types::FormatCode;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A connected async transport stream, plain or TLS.
pub enum AsyncStream {
    Plain(TcpStream),
    #[cfg(feature = "tokio-tls")]
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl AsyncStream {
    /// Whether this stream is already TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        match self {
            AsyncStream::Plain(_) => false,
            #[cfg(feature = "tokio-tls")]
            AsyncStream::Tls(_) => true,
        }
    }

    /// Upgrade a plain stream to TLS in place.
    #[cfg(feature = "tokio-tls")]
    pub async fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        match self {
            AsyncStream::Plain(tcp) => {
                let connector =
                    tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
                let tls = connector.connect(host, tcp).await.map_err(Error::Tls)?;
                Ok(AsyncStream::Tls(Box::new(tls)))
            }
            #[cfg(feature = "tokio-tls")]
            AsyncStream::Tls(_) => Err(Error::InvalidUsage("stream is already TLS".into())),
        }
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            AsyncStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tokio-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            AsyncStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tokio-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            AsyncStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tokio-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            AsyncStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tokio-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Resolve `host:port` and connect, partitioning the remaining timeout
/// budget evenly across the addresses left to try, same as
/// [`crate::transport::connect_tcp`].
async fn connect_tcp_async(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let deadline = TokioInstant::now() + timeout;

    let addrs: Vec<_> = lookup_host((host, port))
        .await
        .map_err(Error::Io)?
        .collect();

    if addrs.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {host}:{port}"),
        )));
    }

    let mut last_err = None;
    let total = addrs.len();
    for (i, addr) in addrs.into_iter().enumerate() {
        let remaining = deadline.saturating_duration_since(TokioInstant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout(format!(
                "connecting to {host}:{port} exceeded the configured timeout"
            )));
        }
        let addresses_left = total - i;
        let per_addr_budget = remaining / u32::try_from(addresses_left).unwrap_or(1);

        match tokio::time::timeout(per_addr_budget, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).map_err(Error::Io)?;
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => {
                last_err = Some(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
            }
        }
    }

    Err(Error::Io(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::TimedOut, "connection attempts exhausted")
    })))
}

/// Async twin of [`crate::buffer::FramedBuffer`].
struct AsyncFramedBuffer<S> {
    stream: S,
    read_buf: Vec<u8>,
    read_start: usize,
    read_end: usize,
    write_buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncFramedBuffer<S> {
    fn new(stream: S, capacity: usize) -> Self {
        Self {
            stream,
            read_buf: vec![0u8; capacity],
            read_start: 0,
            read_end: 0,
            write_buf: Vec::with_capacity(capacity),
        }
    }

    fn buffered(&self) -> usize {
        self.read_end - self.read_start
    }

    async fn ensure(&mut self, n: usize) -> Result<()> {
        if self.buffered() >= n {
            return Ok(());
        }

        if self.read_start > 0 {
            self.read_buf.copy_within(self.read_start..self.read_end, 0);
            self.read_end -= self.read_start;
            self.read_start = 0;
        }

        if self.read_buf.len() < n {
            self.read_buf.resize(n, 0);
        }

        while self.buffered() < n {
            let read = self.stream.read(&mut self.read_buf[self.read_end..]).await?;
            if read == 0 {
                return Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }
            self.read_end += read;
        }

        Ok(())
    }

    fn take(&mut self, n: usize) -> &[u8] {
        let start = self.read_start;
        self.read_start += n;
        &self.read_buf[start..start + n]
    }

    async fn read_message(&mut self) -> Result<backend::RawMessage<'_>> {
        self.ensure(1).await?;
        let type_byte = self.read_buf[self.read_start];
        self.read_start += 1;

        self.ensure(4).await?;
        let len_bytes = self.take(4);
        let length = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let payload_len = (length as usize).saturating_sub(4);

        self.ensure(payload_len).await?;
        let payload = self.take(payload_len);

        Ok(backend::RawMessage::new(type_byte, payload))
    }

    fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.write_buf
    }

    fn write_space_left(&self) -> usize {
        self.write_buf.capacity() - self.write_buf.len()
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_direct(&mut self, data: &[u8]) -> Result<()> {
        self.flush().await?;
        self.stream.write_all(data).await?;
        Ok(())
    }
}

/// Drive the AuthenticationRequest sub-dialog to completion, the async twin
/// of [`crate::auth::authenticate`].
async fn authenticate_async<S: AsyncRead + AsyncWrite + Unpin>(
    buf: &mut AsyncFramedBuffer<S>,
    user: &str,
    password: Option<&str>,
    mut gss: Option<&mut dyn SaslProvider>,
) -> Result<()> {
    loop {
        let msg = buf.read_message().await?;
        match msg.type_byte {
            t if t == backend::msg_type::AUTHENTICATION => {
                use crate::protocol::backend::AuthenticationMessage;
                let auth = AuthenticationMessage::parse(msg.payload)?;
                match auth {
                    AuthenticationMessage::Ok => return Ok(()),
                    AuthenticationMessage::CleartextPassword => {
                        let password = password.ok_or_else(|| {
                            Error::Auth("server requested a password but none was set".into())
                        })?;
                        write_password(buf.buffer_mut(), password);
                        buf.flush().await?;
                    }
                    AuthenticationMessage::Md5Password { salt } => {
                        let password = password.ok_or_else(|| {
                            Error::Auth("server requested a password but none was set".into())
                        })?;
                        let hashed = md5_password(user, password, &salt);
                        write_password(buf.buffer_mut(), &hashed);
                        buf.flush().await?;
                    }
                    AuthenticationMessage::Gss | AuthenticationMessage::Sspi => match gss.as_deref_mut() {
                        Some(provider) => match provider.step(&[]) {
                            Some(token) => {
                                write_gss_response(buf.buffer_mut(), &token);
                                buf.flush().await?;
                            }
                            None => {
                                return Err(Error::Auth(
                                    "GSS/SSPI provider produced no initial token".into(),
                                ));
                            }
                        },
                        None => {
                            return Err(Error::Unsupported(
                                "server requires GSS/SSPI authentication but no provider was configured"
                                    .into(),
                            ));
                        }
                    },
                    AuthenticationMessage::GssContinue { data } => match gss.as_deref_mut() {
                        Some(provider) => match provider.step(data) {
                            Some(token) => {
                                write_gss_response(buf.buffer_mut(), &token);
                                buf.flush().await?;
                            }
                            None => continue,
                        },
                        None => {
                            return Err(Error::Unsupported(
                                "server requires GSS/SSPI authentication but no provider was configured"
                                    .into(),
                            ));
                        }
                    },
                    AuthenticationMessage::KerberosV5 => {
                        return Err(Error::Unsupported(
                            "Kerberos V5 authentication is not supported".into(),
                        ));
                    }
                    AuthenticationMessage::Sasl { mechanisms } => {
                        return Err(Error::Unsupported(format!(
                            "SASL authentication ({}) is not supported",
                            mechanisms.join(", ")
                        )));
                    }
                    AuthenticationMessage::SaslContinue { .. }
                    | AuthenticationMessage::SaslFinal { .. } => {
                        return Err(Error::Unsupported(
                            "SASL authentication is not supported".into(),
                        ));
                    }
                }
            }
            t if t == backend::msg_type::ERROR_RESPONSE => {
                return Err(ErrorResponse::parse(msg.payload)?.into_error());
            }
            t if t == backend::msg_type::PARAMETER_STATUS
                || t == backend::msg_type::NOTICE_RESPONSE =>
            {
                continue;
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message type '{}' during authentication",
                    other as char
                )));
            }
        }
    }
}

/// The async twin of [`crate::connector::Connector`]. Same state machine,
/// same message ordering, driven by `.await` instead of blocking I/O.
pub struct AsyncConnector<S> {
    buf: AsyncFramedBuffer<S>,
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

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncConnector<S> {
    async fn open_on_stream(stream: S, opts: &Opts, buffer_size: usize) -> Result<Self> {
        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::debug_span!("async_connector_open", conn_id);
        let _enter = span.enter();

        let mut buf = AsyncFramedBuffer::new(stream, buffer_size);

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
        buf.flush().await?;

        authenticate_async(&mut buf, &opts.user, opts.password.as_deref(), None).await?;

        let mut params = HashMap::new();
        let mut backend_key = None;

        loop {
            let ready = {
                let msg = buf.read_message().await?;
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

        let server_version = params.get("server_version").cloned().unwrap_or_default();
        let mut features = ServerFeatures::from_server_version(&server_version);
        if let Some(value) = params.get("standard_conforming_strings") {
            features.set_standard_conforming_strings(value);
        }

        tracing::debug!(conn_id, server_version, "async connector ready");

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

    /// The backend process id and secret key, for cancellation.
    pub fn backend_key(&self) -> Option<(u32, u32)> {
        self.backend_key
    }

    /// Server capability flags derived from `server_version`.
    pub fn features(&self) -> ServerFeatures {
        self.features
    }

    /// Look up a reported server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    /// Whether the transport is TLS-wrapped.
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

    fn prepend_simple_query(&mut self, sql: &str) {
        frontend::write_query(self.buf.buffer_mut(), sql);
        self.pending_rfq_prepended += 1;
    }

    /// Prepend a `BEGIN` and mark the transaction status `Pending`
    /// immediately (see [`crate::connector::Connector::begin`]).
    pub fn begin(&mut self) -> Result<()> {
        self.require_ready()?;
        self.prepend_simple_query("BEGIN");
        self.tx_status = TransactionStatus::Pending;
        Ok(())
    }

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
    /// carries these through the ordinary prepended-drain path (spec §4.5:
    /// "Does not flush; the next real operation will flush them
    /// transparently").
    pub async fn reset(&mut self) -> Result<()> {
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

    fn maybe_prepend_statement_timeout(&mut self, wanted: Option<Duration>) {
        if wanted == self.active_statement_timeout {
            return;
        }
        let millis = wanted.map(|d| d.as_millis()).unwrap_or(0);
        self.prepend_simple_query(&format!("SET statement_timeout = {millis}"));
        self.active_statement_timeout = wanted;
    }

    /// Encode a simple-protocol Query message.
    pub fn add_query(&mut self, sql: &str) -> Result<()> {
        self.require_ready()?;
        let timeout = self.command_timeout;
        self.maybe_prepend_statement_timeout(timeout);
        frontend::write_query(self.buf.buffer_mut(), sql);
        self.state = ConnectorState::Executing;
        Ok(())
    }

    /// Encode a Parse/Bind/Describe/Execute/Sync batch for the extended
    /// query protocol.
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

    /// Flush every queued frontend message.
    pub async fn send_all(&mut self) -> Result<()> {
        self.buf.flush().await?;
        self.sent_rfq_prepended += self.pending_rfq_prepended;
        self.pending_rfq_prepended = 0;
        Ok(())
    }

    async fn drain_prepended(&mut self) -> Result<()> {
        while self.sent_rfq_prepended > 0 {
            self.read_single().await?;
        }
        Ok(())
    }

    /// Read and dispatch one backend message, transparently consuming
    /// ParameterStatus/NoticeResponse/NotificationResponse and prepended
    /// ReadyForQuery drains; the async twin of
    /// [`crate::connector::Connector::read_single`].
    pub async fn read_single(&mut self) -> Result<Option<Message<'_>>> {
        if self.state == ConnectorState::Broken {
            return Err(Error::ConnectionBroken);
        }

        let result = self.read_single_inner().await;
        if let Err(ref e) = result {
            if e.is_connection_broken() {
                self.state = ConnectorState::Broken;
                tracing::error!(conn_id = self.conn_id, "connector broken: {e}");
            }
        }
        result
    }

    async fn read_single_inner(&mut self) -> Result<Option<Message<'_>>> {
        let msg = self.buf.read_message().await?;
        let type_byte = msg.type_byte;
        let payload_ptr = msg.payload.as_ptr();
        let payload_len = msg.payload.len();
        // SAFETY: mirrors `Connector::read_single_inner` — the slice borrows
        // `self.buf`'s read buffer, which the match below only touches
        // through non-reallocating bookkeeping calls before the borrow ends.
        let payload: &[u8] = unsafe { std::slice::from_raw_parts(payload_ptr, payload_len) };

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

    /// Send CopyData during a COPY IN.
    pub async fn copy_data(&mut self, data: &[u8]) -> Result<()> {
        if self.state != ConnectorState::Copy {
            return Err(Error::InvalidUsage("not in a COPY operation".into()));
        }
        if data.len() > self.buf.write_space_left() {
            let mut header = Vec::with_capacity(5);
            header.push(frontend::msg_type::COPY_DATA);
            header.extend_from_slice(&((data.len() + 4) as i32).to_be_bytes());
            self.buf.write_direct(&header).await?;
            self.buf.write_direct(data).await?;
            Ok(())
        } else {
            frontend::write_copy_data(self.buf.buffer_mut(), data);
            Ok(())
        }
    }

    /// Signal normal completion of a COPY IN.
    pub async fn copy_done(&mut self) -> Result<()> {
        frontend::write_copy_done(self.buf.buffer_mut());
        frontend::write_sync(self.buf.buffer_mut());
        self.send_all().await
    }

    /// Abort a COPY IN with an error message sent to the server.
    pub async fn copy_fail(&mut self, message: &str) -> Result<()> {
        frontend::write_copy_fail(self.buf.buffer_mut(), message);
        frontend::write_sync(self.buf.buffer_mut());
        self.send_all().await
    }

    /// Close the connection gracefully with a Terminate message.
    pub async fn close(mut self) -> Result<()> {
        if self.state == ConnectorState::Broken {
            return Ok(());
        }
        frontend::write_terminate(self.buf.buffer_mut());
        self.buf.flush().await?;
        self.state = ConnectorState::Closed;
        Ok(())
    }

    /// Mark the connection unusable without attempting any further I/O.
    pub fn break_connection(&mut self) {
        self.state = ConnectorState::Broken;
    }
}

impl AsyncConnector<AsyncStream> {
    /// Open an async connection to a PostgreSQL server.
    pub async fn open(opts: &Opts) -> Result<Self> {
        let tcp = connect_tcp_async(&opts.host, opts.port, opts.timeout).await?;
        let mut stream = AsyncStream::Plain(tcp);

        if crate::transport::ssl_attempted(opts.ssl_mode) {
            let mut negotiate_buf = Vec::new();
            frontend::write_ssl_request(&mut negotiate_buf);
            stream.write_all(&negotiate_buf).await?;
            stream.flush().await?;

            let mut reply = [0u8; 1];
            stream.read_exact(&mut reply).await?;

            match reply[0] {
                b'S' => {
                    #[cfg(feature = "tokio-tls")]
                    {
                        stream = stream.upgrade_to_tls(&opts.host).await?;
                    }
                    #[cfg(not(feature = "tokio-tls"))]
                    {
                        return Err(Error::Unsupported(
                            "server accepted TLS but the tokio-tls feature is not enabled".into(),
                        ));
                    }
                }
                b'N' => {
                    if crate::transport::ssl_required(opts.ssl_mode) {
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
        let mut connector = Self::open_on_stream(stream, opts, opts.buffer_size).await?;
        connector.is_secure = is_secure;

        if let Some(search_path) = &opts.search_path {
            connector.add_query(&format!("SET search_path TO {search_path}"))?;
            connector.send_all().await?;
            loop {
                match connector.read_single().await? {
                    Some(Message::ReadyForQuery(_)) => break,
                    Some(_) | None => continue,
                }
            }
        }

        Ok(connector)
    }

    /// Open a side-channel connection and issue a CancelRequest, the async
    /// twin of [`crate::connector::Connector::cancel_request`].
    pub async fn cancel_request(
        host: &str,
        port: u16,
        timeout: Duration,
        backend_pid: u32,
        backend_secret: u32,
    ) -> Result<()> {
        let mut stream = connect_tcp_async(host, port, timeout).await?;
        let mut buf = Vec::new();
        frontend::write_cancel_request(&mut buf, backend_pid, backend_secret);
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_runs_startup_against_a_mock_server() {
        let (client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            // Drain the StartupMessage without inspecting it.
            let mut len_buf = [0u8; 4];
            server.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut rest = vec![0u8; len - 4];
            server.read_exact(&mut rest).await.unwrap();

            let mut reply = Vec::new();
            // AuthenticationOk
            reply.push(b'R');
            reply.extend_from_slice(&8i32.to_be_bytes());
            reply.extend_from_slice(&0i32.to_be_bytes());
            // ParameterStatus server_version
            reply.push(b'S');
            let mut ps_payload = Vec::new();
            ps_payload.extend_from_slice(b"server_version\0");
            ps_payload.extend_from_slice(b"14.2\0");
            reply.extend_from_slice(&((ps_payload.len() + 4) as i32).to_be_bytes());
            reply.extend_from_slice(&ps_payload);
            // BackendKeyData
            reply.push(b'K');
            reply.extend_from_slice(&12i32.to_be_bytes());
            reply.extend_from_slice(&42i32.to_be_bytes());
            reply.extend_from_slice(&99i32.to_be_bytes());
            // ReadyForQuery Idle
            reply.push(b'Z');
            reply.extend_from_slice(&5i32.to_be_bytes());
            reply.push(b'I');

            server.write_all(&reply).await.unwrap();
        });

        let opts = Opts {
            user: "u".into(),
            ..Opts::default()
        };
        let conn = AsyncConnector::open_on_stream(client, &opts, 256).await.unwrap();
        assert_eq!(conn.state(), ConnectorState::Ready);
        assert_eq!(conn.backend_key(), Some((42, 99)));
        assert_eq!(conn.parameter("server_version"), Some("14.2"));
        assert!(conn.features().supports_savepoint);

        server_task.await.unwrap();
    }
}

//! Authenticator: drives the AuthenticationRequest sub-dialog.
//!
//! Supports cleartext password, MD5 password, and GSS/SSPI continuation (via
//! a pluggable [`SaslProvider`]). Any other authentication request — SASL
//! (SCRAM), Kerberos V5 — fails with `Error::Unsupported`; the real-world
//! SASL/SCRAM client lives above this crate's scope.

use std::io::{Read, Write};

use crate::buffer::FramedBuffer;
use crate::error::{Error, Result};
use crate::protocol::backend::auth::auth_type;
use crate::protocol::backend::{AuthenticationMessage, ErrorResponse};
use crate::protocol::backend::msg_type as backend_msg_type;
use crate::protocol::frontend::{md5_password, write_gss_response, write_password};

/// A pluggable GSSAPI/SSPI continuation provider.
///
/// Given the server's current token (empty on the first call), returns the
/// client's next token, or `None` once the client side of the exchange is
/// complete.
pub trait SaslProvider {
    fn step(&mut self, server_token: &[u8]) -> Option<Vec<u8>>;
}

/// What the Authenticator decided to do in response to one
/// AuthenticationRequest message, decoupled from the framed buffer's borrow.
enum Step {
    /// AuthenticationOk was received; the sub-dialog is complete.
    Done,
    /// Send a PasswordMessage with this already-formatted payload.
    SendPassword(String),
    /// Send a GSS/SSPI continuation token.
    SendGssToken(Vec<u8>),
    /// Nothing to send; keep reading (e.g. bare `AuthenticationGSS`/`AuthenticationSSPI`
    /// before the provider has produced a token yet, which is itself unsupported
    /// unless a provider is configured).
    Continue,
}

/// Drive authentication to completion (`AuthenticationOk`) or a terminal
/// `Error`. `gss` is consulted only for GSS/SSPI continuation requests.
pub fn authenticate<S: Read + Write>(
    buf: &mut FramedBuffer<S>,
    user: &str,
    password: Option<&str>,
    mut gss: Option<&mut dyn SaslProvider>,
) -> Result<()> {
    loop {
        let step = {
            let msg = buf.read_message()?;
            match msg.type_byte {
                t if t == backend_msg_type::AUTHENTICATION => {
                    let auth = AuthenticationMessage::parse(msg.payload)?;
                    decide(auth, user, password, gss.as_deref_mut())?
                }
                t if t == backend_msg_type::ERROR_RESPONSE => {
                    return Err(ErrorResponse::parse(msg.payload)?.into_error());
                }
                t if t == backend_msg_type::PARAMETER_STATUS
                    || t == backend_msg_type::NOTICE_RESPONSE =>
                {
                    // Async chatter can legally precede authentication completion;
                    // the Connector reconciles these once the session is Ready.
                    Step::Continue
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message type '{}' during authentication",
                        other as char
                    )));
                }
            }
        };

        match step {
            Step::Done => return Ok(()),
            Step::Continue => continue,
            Step::SendPassword(payload) => {
                write_password(buf.buffer_mut(), &payload);
                buf.flush()?;
            }
            Step::SendGssToken(token) => {
                write_gss_response(buf.buffer_mut(), &token);
                buf.flush()?;
            }
        }
    }
}

fn decide(
    auth: AuthenticationMessage<'_>,
    user: &str,
    password: Option<&str>,
    gss: Option<&mut dyn SaslProvider>,
) -> Result<Step> {
    match auth {
        AuthenticationMessage::Ok => Ok(Step::Done),
        AuthenticationMessage::CleartextPassword => {
            let password = password
                .ok_or_else(|| Error::Auth("server requested a password but none was set".into()))?;
            Ok(Step::SendPassword(password.to_string()))
        }
        AuthenticationMessage::Md5Password { salt } => {
            let password = password
                .ok_or_else(|| Error::Auth("server requested a password but none was set".into()))?;
            Ok(Step::SendPassword(md5_password(user, password, &salt)))
        }
        AuthenticationMessage::Gss | AuthenticationMessage::Sspi => match gss {
            Some(provider) => match provider.step(&[]) {
                Some(token) => Ok(Step::SendGssToken(token)),
                None => Err(Error::Auth(
                    "GSS/SSPI provider produced no initial token".into(),
                )),
            },
            None => Err(Error::Unsupported(
                "server requires GSS/SSPI authentication but no provider was configured".into(),
            )),
        },
        AuthenticationMessage::GssContinue { data } => match gss {
            Some(provider) => match provider.step(data) {
                Some(token) => Ok(Step::SendGssToken(token)),
                None => Ok(Step::Continue),
            },
            None => Err(Error::Unsupported(
                "server requires GSS/SSPI authentication but no provider was configured".into(),
            )),
        },
        AuthenticationMessage::KerberosV5 => Err(Error::Unsupported(
            "Kerberos V5 authentication is not supported".into(),
        )),
        AuthenticationMessage::Sasl { mechanisms } => Err(Error::Unsupported(format!(
            "SASL authentication ({}) is not supported",
            mechanisms.join(", ")
        ))),
        AuthenticationMessage::SaslContinue { .. } | AuthenticationMessage::SaslFinal { .. } => {
            Err(Error::Unsupported("SASL authentication is not supported".into()))
        }
    }
}

/// Authentication kind constant re-exports used by higher layers for
/// logging/diagnostics without needing the raw wire values.
pub mod kind {
    pub use super::auth_type::*;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_vector_matches_spec() {
        // u="u", p="p", salt=0x01020304 — the canonical test vector.
        let hashed = md5_password("u", "p", &[0x01, 0x02, 0x03, 0x04]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 35);
    }

    struct NoopProvider;
    impl SaslProvider for NoopProvider {
        fn step(&mut self, _server_token: &[u8]) -> Option<Vec<u8>> {
            None
        }
    }

    #[test]
    fn cleartext_without_password_is_auth_error() {
        let err = decide(AuthenticationMessage::CleartextPassword, "u", None, None).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn sasl_is_unsupported() {
        let err = decide(
            AuthenticationMessage::Sasl {
                mechanisms: vec!["SCRAM-SHA-256"],
            },
            "u",
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn gss_without_provider_is_unsupported() {
        let err = decide(AuthenticationMessage::Gss, "u", None, None).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn gss_with_provider_emits_initial_token() {
        struct Once(bool);
        impl SaslProvider for Once {
            fn step(&mut self, _server_token: &[u8]) -> Option<Vec<u8>> {
                if self.0 {
                    self.0 = false;
                    Some(vec![1, 2, 3])
                } else {
                    None
                }
            }
        }
        let mut provider = Once(true);
        let step = decide(AuthenticationMessage::Gss, "u", None, Some(&mut provider)).unwrap();
        assert!(matches!(step, Step::SendGssToken(t) if t == vec![1, 2, 3]));
        let _ = NoopProvider;
    }
}

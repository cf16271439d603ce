mod session;

use std::fmt;
use std::io;

pub use session::SpsSession;

pub const LOGIN_SUCCESS_MARKER: &str = "Login Successful";
pub const SESSION_LAYER_ERROR_RESPONSE: &str = "s:17:\"SessionLayerError\";";
/// Largest response read in one receive call.
pub const RECEIVE_BUFFER_BYTES: usize = 4_095;

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

#[derive(Debug)]
pub enum ProtocolError {
    Send { source: io::Error },
    Receive { source: io::Error },
    ConnectionClosed,
    LoginRejected { response: String },
    /// The response was not valid UTF-8 and cannot be forwarded as text.
    InvalidEncoding { size: usize, valid_up_to: usize },
}

impl ProtocolError {
    /// Socket-level failures that are eligible for reconnect.
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            Self::LoginRejected { .. } | Self::InvalidEncoding { .. }
        )
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send { source } => write!(f, "unable to send data over socket: {source}"),
            Self::Receive { source } => {
                write!(f, "unable to receive data on socket: {source}")
            }
            Self::ConnectionClosed => write!(f, "remote server closed the connection"),
            Self::LoginRejected { response } => write!(
                f,
                "login rejected; response did not contain '{LOGIN_SUCCESS_MARKER}': {response}"
            ),
            Self::InvalidEncoding { size, valid_up_to } => write!(
                f,
                "response of {size} bytes is not valid UTF-8 past byte {valid_up_to}"
            ),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Send { source } | Self::Receive { source } => Some(source),
            Self::ConnectionClosed
            | Self::LoginRejected { .. }
            | Self::InvalidEncoding { .. } => None,
        }
    }
}

fn schema_location(home_path: &str) -> String {
    format!(
        r#"xmlns:xsi="{XSI_NAMESPACE}" xsi:noNamespaceSchemaLocation="{home_path}/Conf/SPS.xsd""#
    )
}

/// Plain username/password login document. Credentials are inserted
/// verbatim.
pub fn login_envelope(home_path: &str, user_name: &str, password: &str) -> String {
    format!(
        "{XML_DECLARATION}<Login {}><Username>{user_name}</Username><Password>{password}</Password><Created></Created><Nonce></Nonce></Login>",
        schema_location(home_path)
    )
}

pub fn logout_envelope(home_path: &str) -> String {
    format!(
        "{XML_DECLARATION}<Logout {}></Logout>",
        schema_location(home_path)
    )
}

pub fn is_login_successful(response: &str) -> bool {
    response.contains(LOGIN_SUCCESS_MARKER)
}

/// Serializes a response body as `s:<byte length>:"<body>";` for the
/// downstream consumer.
pub fn wrap_response(body: &str) -> String {
    format!("s:{}:\"{body}\";", body.len())
}

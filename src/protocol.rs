//! Cross-domain policy protocol.
//!
//! A client sends exactly one request and gets exactly one response:
//!
//! ```text
//! Request:  <policy-file-request/>\0
//! Response: <?xml version="1.0"?> ... </cross-domain-policy>
//!
//! Request:  PING
//! Response: +OK\r\n
//! ```
//!
//! Matching is exact over the bytes received. There is no framing, no
//! trimming and no case folding; anything else is rejected and the
//! connection is closed without a reply.

use std::fmt;

/// Policy file request sent by sandboxed web players.
pub const POLICY_REQUEST: &[u8] = b"<policy-file-request/>\x00";

/// Policy document granting access from any domain to any port.
pub const POLICY_RESPONSE: &[u8] = b"<?xml version=\"1.0\"?>\n\
    <cross-domain-policy>\n   \
    <allow-access-from domain=\"*\" to-ports=\"*\"/> \n\
    </cross-domain-policy>";

/// Liveness check request.
pub const PING_REQUEST: &[u8] = b"PING";

/// Liveness check acknowledgment.
pub const PING_RESPONSE: &[u8] = b"+OK\r\n";

/// Length of the longest known request. Read buffers must hold at least this.
pub const MAX_REQUEST_LEN: usize = max_len(POLICY_REQUEST.len(), PING_REQUEST.len());

const fn max_len(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// A recognized request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Cross-domain policy file request.
    Policy,
    /// Liveness check.
    Ping,
}

impl Request {
    /// The fixed response bytes for this request.
    pub fn response(self) -> &'static [u8] {
        match self {
            Request::Policy => POLICY_RESPONSE,
            Request::Ping => PING_RESPONSE,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Policy => write!(f, "policy"),
            Request::Ping => write!(f, "ping"),
        }
    }
}

/// The received bytes did not match any known request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyError {
    received: Vec<u8>,
}

impl ClassifyError {
    /// The bytes that failed to classify.
    pub fn received(&self) -> &[u8] {
        &self.received
    }
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown protocol request: \"{}\"", escape(self.received()))
    }
}

impl std::error::Error for ClassifyError {}

/// Classify a complete request.
///
/// `input` must be exactly the bytes read from the peer, not the whole
/// read buffer.
pub fn classify(input: &[u8]) -> Result<Request, ClassifyError> {
    if input == POLICY_REQUEST {
        Ok(Request::Policy)
    } else if input == PING_REQUEST {
        Ok(Request::Ping)
    } else {
        Err(ClassifyError {
            received: input.to_vec(),
        })
    }
}

/// Render bytes as printable ASCII for log output.
pub fn escape(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|&b| std::ascii::escape_default(b))
        .map(char::from)
        .collect()
}

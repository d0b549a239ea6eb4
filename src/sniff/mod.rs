//! Content sniffing
//!
//! Classifies the first bytes of a TCP stream into `{tls, http}` and
//! recovers the destination domain (TLS SNI or HTTP Host) so that
//! IP-addressed connections can still be routed by domain.
//!
//! Classifiers are deliberately conservative: they abstain (`NoClue`) on
//! anything that cannot be the protocol and ask for more bytes
//! (`NeedMore`) when the prefix is consistent but incomplete. The caller
//! owns retry and overall timeout policy.

use thiserror::Error;

/// Outcome of a successful sniff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffResult {
    protocol: &'static str,
    domain: String,
}

impl SniffResult {
    pub fn protocol(&self) -> &str {
        self.protocol
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// Failure sentinels of a single sniff attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SniffError {
    /// The prefix is consistent with the protocol but incomplete.
    #[error("need more data")]
    NeedMore,
    /// No classifier recognizes this prefix.
    #[error("no clue")]
    NoClue,
}

type Classifier = fn(&[u8]) -> Result<SniffResult, SniffError>;

/// Per-connection sniffer. Classifiers that abstain are dropped;
/// classifiers that want more data are retried on the next attempt.
pub struct Sniffer {
    pending: Vec<Classifier>,
}

impl Sniffer {
    pub fn new() -> Self {
        Self {
            pending: vec![sniff_tls, sniff_http],
        }
    }

    pub fn sniff(&mut self, data: &[u8]) -> Result<SniffResult, SniffError> {
        let mut retained = Vec::with_capacity(self.pending.len());
        let mut result = Err(SniffError::NoClue);
        for classify in &self.pending {
            match classify(data) {
                Ok(found) => return Ok(found),
                Err(SniffError::NeedMore) => {
                    retained.push(*classify);
                    result = Err(SniffError::NeedMore);
                }
                Err(SniffError::NoClue) => {}
            }
        }
        self.pending = retained;
        result
    }
}

impl Default for Sniffer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TLS ClientHello
// ============================================================================

const TLS_HANDSHAKE: u8 = 22;
const TLS_CLIENT_HELLO: u8 = 1;
const EXT_SERVER_NAME: u16 = 0x0000;

/// Classify a TLS ClientHello and extract the SNI.
fn sniff_tls(buf: &[u8]) -> Result<SniffResult, SniffError> {
    if buf.is_empty() {
        return Err(SniffError::NeedMore);
    }
    if buf[0] != TLS_HANDSHAKE {
        return Err(SniffError::NoClue);
    }
    // Record header: [type(1)][version(2)][length(2)]
    if buf.len() < 5 {
        return Err(SniffError::NeedMore);
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len < 4 {
        return Err(SniffError::NoClue);
    }
    if buf.len() < 5 + record_len {
        return Err(SniffError::NeedMore);
    }
    match parse_client_hello_sni(&buf[5..5 + record_len]) {
        Some(sni) => Ok(SniffResult {
            protocol: "tls",
            domain: sni,
        }),
        None => Err(SniffError::NoClue),
    }
}

/// Walk a complete handshake record and pull the first server_name out
/// of the ClientHello extensions. Any structural violation aborts.
fn parse_client_hello_sni(hs: &[u8]) -> Option<String> {
    // Handshake header: [msg_type(1)][length(3)]
    if hs.len() < 4 || hs[0] != TLS_CLIENT_HELLO {
        return None;
    }
    let body_len = ((hs[1] as usize) << 16) | ((hs[2] as usize) << 8) | hs[3] as usize;
    let body = hs.get(4..4 + body_len)?;

    // version(2) + random(32)
    let mut p = 34;
    // session_id
    let sid_len = *body.get(p)? as usize;
    p += 1 + sid_len;
    // cipher_suites
    let cs_len = u16::from_be_bytes([*body.get(p)?, *body.get(p + 1)?]) as usize;
    p += 2 + cs_len;
    // compression_methods
    let cm_len = *body.get(p)? as usize;
    p += 1 + cm_len;
    // extensions
    let ext_total = u16::from_be_bytes([*body.get(p)?, *body.get(p + 1)?]) as usize;
    p += 2;
    let mut ext = body.get(p..p + ext_total)?;

    while ext.len() >= 4 {
        let ext_type = u16::from_be_bytes([ext[0], ext[1]]);
        let ext_len = u16::from_be_bytes([ext[2], ext[3]]) as usize;
        let data = ext.get(4..4 + ext_len)?;
        ext = &ext[4 + ext_len..];

        if ext_type != EXT_SERVER_NAME {
            continue;
        }
        // server_name_list: [list_len(2)] then entries [type(1)][len(2)][name]
        let mut names = data.get(2..)?;
        while names.len() >= 3 {
            let name_type = names[0];
            let name_len = u16::from_be_bytes([names[1], names[2]]) as usize;
            let name = names.get(3..3 + name_len)?;
            names = &names[3 + name_len..];
            if name_type == 0 {
                return std::str::from_utf8(name).ok().map(str::to_string);
            }
        }
    }
    None
}

// ============================================================================
// HTTP/1.x
// ============================================================================

const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "CONNECT", "TRACE", "PATCH",
];

/// Classify an HTTP/1.x request and extract the Host header value.
fn sniff_http(buf: &[u8]) -> Result<SniffResult, SniffError> {
    let text = match std::str::from_utf8(buf) {
        Ok(t) => t,
        Err(e) if e.valid_up_to() == 0 => return Err(SniffError::NoClue),
        // Binary tail after a valid prefix: judge on what decoded so far.
        Err(e) => std::str::from_utf8(&buf[..e.valid_up_to()]).unwrap_or(""),
    };

    if !starts_with_http_method(text) {
        return Err(SniffError::NoClue);
    }

    // Request line must be complete before the headers are trustworthy.
    let Some((request_line, rest)) = text.split_once("\r\n") else {
        return Err(SniffError::NeedMore);
    };
    if !request_line.contains(" HTTP/1.") {
        return Err(SniffError::NoClue);
    }

    for line in rest.lines().take(64) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            // End of headers, no Host seen.
            return Err(SniffError::NoClue);
        }
        if line.len() >= 5 && line[..5].eq_ignore_ascii_case("host:") {
            let host = line[5..].trim();
            let domain = host.rsplit_once(':').map_or(host, |(h, _)| h);
            if domain.is_empty() {
                return Err(SniffError::NoClue);
            }
            return Ok(SniffResult {
                protocol: "http",
                domain: domain.to_string(),
            });
        }
    }
    Err(SniffError::NeedMore)
}

fn starts_with_http_method(text: &str) -> bool {
    HTTP_METHODS.iter().any(|m| {
        if text.len() >= m.len() + 1 {
            text.starts_with(m) && text.as_bytes()[m.len()] == b' '
        } else {
            // Too short to rule out: could be a method prefix.
            m.starts_with(text)
        }
    })
}

/// Build a minimal ClientHello record carrying one server_name.
#[cfg(test)]
pub(crate) fn client_hello(sni: &str) -> Vec<u8> {
    let name = sni.as_bytes();
    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
    sni_ext.push(0); // host_name
    sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(name);

    let mut exts = Vec::new();
    exts.extend_from_slice(&0u16.to_be_bytes()); // server_name
    exts.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    exts.extend_from_slice(&sni_ext);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session_id
    body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites len
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1); // compression_methods len
    body.push(0);
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut hs = vec![TLS_CLIENT_HELLO];
    hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    hs.extend_from_slice(&body);

    let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    record.extend_from_slice(&hs);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_client_hello_yields_sni() {
        let hello = client_hello("www.example");
        let mut sniffer = Sniffer::new();
        let result = sniffer.sniff(&hello).unwrap();
        assert_eq!(result.protocol(), "tls");
        assert_eq!(result.domain(), "www.example");
    }

    #[test]
    fn truncated_client_hello_wants_more() {
        let hello = client_hello("www.example");
        let mut sniffer = Sniffer::new();
        assert_eq!(
            sniffer.sniff(&hello[..8]),
            Err(SniffError::NeedMore)
        );
        // Completing the record succeeds on the next attempt.
        assert_eq!(sniffer.sniff(&hello).unwrap().domain(), "www.example");
    }

    #[test]
    fn http_request_yields_host() {
        let req = b"GET /index HTTP/1.1\r\nAccept: */*\r\nHost: example.com:8080\r\n\r\n";
        let mut sniffer = Sniffer::new();
        let result = sniffer.sniff(req).unwrap();
        assert_eq!(result.protocol(), "http");
        assert_eq!(result.domain(), "example.com");
    }

    #[test]
    fn partial_http_request_wants_more() {
        let mut sniffer = Sniffer::new();
        assert_eq!(sniffer.sniff(b"GE"), Err(SniffError::NeedMore));
        assert_eq!(
            sniffer.sniff(b"GET / HTTP/1.1\r\nAccept"),
            Err(SniffError::NeedMore)
        );
    }

    #[test]
    fn random_bytes_are_no_clue() {
        let mut sniffer = Sniffer::new();
        let noise: Vec<u8> = (0u16..512).map(|i| (i * 7 % 251) as u8 | 0x80).collect();
        assert_eq!(sniffer.sniff(&noise), Err(SniffError::NoClue));
        // Once every classifier abstained, the sniffer stays clueless.
        assert_eq!(sniffer.sniff(&noise), Err(SniffError::NoClue));
    }

    #[test]
    fn http_without_host_is_no_clue() {
        let req = b"GET / HTTP/1.0\r\nAccept: */*\r\n\r\n";
        let mut sniffer = Sniffer::new();
        assert_eq!(sniffer.sniff(req), Err(SniffError::NoClue));
    }
}

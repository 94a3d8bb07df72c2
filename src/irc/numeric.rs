//! P10 numerics: base64-encoded server and user identities.
//!
//! A server is identified by a one or two character numeric (`YY`) and a user by
//! its server's numeric followed by a two or three character index (`YYXXX`). The
//! short forms are legacy; internally everything is kept in the canonical
//! 2+3 width so lookups are a plain string compare.

use std::net::IpAddr;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789[]";

/// Largest user capacity a server can advertise (`]]]`).
pub const MAX_CAPACITY: u32 = 64 * 64 * 64 - 1;

fn digit(c: u8) -> Option<u32> {
    ALPHABET.iter().position(|&a| a == c).map(|p| p as u32)
}

/// Encode `value` in exactly `width` base64 digits (high digits truncated).
pub fn encode(mut value: u32, width: usize) -> String {
    let mut out = vec![b'A'; width];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value & 63) as usize];
        value >>= 6;
    }
    out.into_iter().map(char::from).collect()
}

/// Decode a base64 numeric. `None` on an empty string or a foreign character.
pub fn decode(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 5 {
        return None;
    }
    s.bytes()
        .try_fold(0u32, |acc, c| digit(c).map(|d| (acc << 6) | d))
}

/// Canonical two-character form of a server numeric given as 1 or 2 chars.
pub fn canonical_server(s: &str) -> Option<String> {
    match s.len() {
        1 | 2 => decode(s).map(|n| encode(n, 2)),
        _ => None,
    }
}

/// Canonical five-character form of a user numeric given as 3 or 5 chars.
pub fn canonical_user(s: &str) -> Option<String> {
    let split = match s.len() {
        3 => 1,
        5 => 2,
        _ => return None,
    };
    let server = decode(s.get(..split)?)?;
    let user = decode(s.get(split..)?)?;
    Some(format!("{}{}", encode(server, 2), encode(user, 3)))
}

/// Split the `YYXXX` field of a SERVER line into the canonical server
/// numeric and its advertised user capacity.
pub fn split_server_field(yxx: &str) -> Option<(String, u32)> {
    let split = match yxx.len() {
        3 => 1,
        5 => 2,
        _ => return None,
    };
    let server = decode(yxx.get(..split)?)?;
    let capacity = decode(yxx.get(split..)?)?;
    Some((encode(server, 2), capacity))
}

/// The `YYXXX` field we send for ourselves.
pub fn server_field(numeric: &str, capacity: u32) -> String {
    format!("{numeric}{}", encode(capacity.min(MAX_CAPACITY), 3))
}

/// Encode an address the way NICK bursts carry it. Only IPv4 fits; anything
/// else is sent as zero.
pub fn encode_ip(addr: Option<IpAddr>) -> String {
    match addr {
        Some(IpAddr::V4(v4)) => encode(u32::from(v4), 6),
        _ => encode(0, 6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_pads_to_width() {
        assert_eq!(encode(0, 2), "AA");
        assert_eq!(encode(1, 2), "AB");
        assert_eq!(encode(63, 1), "]");
        assert_eq!(encode(MAX_CAPACITY, 3), "]]]");
    }

    #[test]
    fn decode_rejects_foreign_characters() {
        assert_eq!(decode("A!"), None);
        assert_eq!(decode(""), None);
        assert_eq!(decode("Ba"), Some(64 + 26));
    }

    #[test]
    fn short_forms_are_canonicalised() {
        assert_eq!(canonical_server("B").as_deref(), Some("AB"));
        assert_eq!(canonical_server("AB").as_deref(), Some("AB"));
        assert_eq!(canonical_user("BAC").as_deref(), Some("ABAAC"));
        assert_eq!(canonical_user("ABAAC").as_deref(), Some("ABAAC"));
        assert_eq!(canonical_user("ABAA"), None);
    }

    #[test]
    fn server_field_splits() {
        assert_eq!(split_server_field("AB]]]"), Some(("AB".into(), MAX_CAPACITY)));
        assert_eq!(split_server_field("B]]"), Some(("AB".into(), 4095)));
        assert_eq!(split_server_field("ABCD"), None);
        assert_eq!(server_field("AC", 4095), "ACA]]");
    }

    #[test]
    fn ipv4_is_six_digits() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(encode_ip(Some(ip)), "B]AAAB");
        assert_eq!(encode_ip(None), "AAAAAA");
    }
}

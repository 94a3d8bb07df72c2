pub mod burst;
pub mod channel;
pub mod codec;
pub mod conf;
pub mod crule;
pub mod handlers;
pub mod ircd;
pub mod matching;
pub mod message;
pub mod msgtab;
pub mod numeric;
pub mod parse;
pub mod server;
pub mod topology;
pub mod trie;

/// Longest server name or host we keep.
pub const HOSTLEN: usize = 63;
/// Longest server description or realname we keep.
pub const REALLEN: usize = 50;
/// Longest nick.
pub const NICKLEN: usize = 15;
/// Largest hop count we accept from a link.
pub const MAXHOPS: u32 = 255;
/// Timestamps before this are bogus.
pub const OLDEST_TS: i64 = 780_000_000;
/// Protocol version we speak.
pub const MAJOR_PROTOCOL: u16 = 10;
/// Oldest protocol version we link with.
pub const MINOR_PROTOCOL: u16 = 9;
/// Version string shown to clients.
pub const VERSION: &str = concat!("lagoon-ircd-", env!("CARGO_PKG_VERSION"));

/// Truncate to at most `max` bytes without splitting a character.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Leading integer of `s`, like C `atoi`: optional sign, digits, zero if none.
pub(crate) fn atoi(s: &str) -> i64 {
    let s = s.trim_start();
    let (neg, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let n = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| acc.saturating_mul(10).saturating_add(i64::from(d - b'0')));
    if neg {
        -n
    } else {
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atoi_takes_leading_digits() {
        assert_eq!(atoi("10"), 10);
        assert_eq!(atoi("10abc"), 10);
        assert_eq!(atoi("-5"), -5);
        assert_eq!(atoi("x"), 0);
        assert_eq!(atoi(""), 0);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("hé", 2), "h");
        assert_eq!(truncate("ok", 10), "ok");
    }
}

//! Alias and socket identifiers.
//!
//! An alias names one relay connection. A socket id names one negotiable
//! sub-connection multiplexed over that relay connection and always has the
//! form `alias|counter`. The relay routes on the alias prefix of a socket id,
//! and the anti-spoofing check compares that prefix with the alias of the
//! connection the message arrived on, so the parsing rule here is exact.

use rand::Rng;

/// Separator between the alias and the counter of a socket id
pub const SOCKET_ID_SEPARATOR: char = '|';

/// First character of every relay-assigned alias
pub const ALIAS_PREFIX: char = 'P';

/// Number of random letters following [`ALIAS_PREFIX`]
pub const ALIAS_RANDOM_LEN: usize = 17;

/// Extract the alias prefix of a socket id.
///
/// Returns the substring before the first [`SOCKET_ID_SEPARATOR`]. An id with
/// no separator has an empty prefix, which the relay treats as a routing error.
#[must_use]
pub fn alias_prefix(socket_id: &str) -> &str {
    match socket_id.find(SOCKET_ID_SEPARATOR) {
        Some(idx) => &socket_id[..idx],
        None => "",
    }
}

/// Format a socket id from an alias and a per-session counter.
///
/// The counter is rendered in lowercase base 36.
#[must_use]
pub fn socket_id(alias: &str, counter: u64) -> String {
    format!("{alias}{SOCKET_ID_SEPARATOR}{}", to_base36(counter))
}

/// Generate a fresh random alias (`P` followed by uppercase letters).
#[must_use]
pub fn generate_alias() -> String {
    let mut rng = rand::thread_rng();
    let mut alias = String::with_capacity(ALIAS_RANDOM_LEN + 1);
    alias.push(ALIAS_PREFIX);
    for _ in 0..ALIAS_RANDOM_LEN {
        alias.push(char::from(b'A' + rng.gen_range(0..26u8)));
    }
    alias
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if n == 0 {
        return "0".to_string();
    }

    let mut buf = Vec::with_capacity(13);
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

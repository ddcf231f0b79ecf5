//! Order message payloads.

const PREFIX: &str = "js msg ";

/// Payload of the `n`th created order, e.g. `js msg 07`.
pub fn created_payload(n: usize) -> String {
    format!("{PREFIX}{n:02}")
}

/// Payloads of a sender run of `count` orders, numbered from zero.
pub fn created_payloads(count: usize) -> impl Iterator<Item = String> {
    (0..count).map(created_payload)
}

/// Inverse of [`created_payload`].
pub fn parse_created_payload(payload: &[u8]) -> Option<usize> {
    std::str::from_utf8(payload)
        .ok()?
        .strip_prefix(PREFIX)?
        .parse()
        .ok()
}

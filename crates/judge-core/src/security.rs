use subtle::ConstantTimeEq;

/// Constant-time comparison of a presented token against the configured
/// shared secret. Ordinary `==` short-circuits on the first mismatched
/// byte, which leaks timing information about how much of the token the
/// caller got right; this does not.
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

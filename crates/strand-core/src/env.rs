//! Environment variable helpers used by the config layer
//!
//! All readers fall back to the supplied default when the variable is
//! unset or does not parse. They never fail.

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and well formed
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag
///
/// `1/true/yes/on` and `0/false/no/off` are recognized case-insensitively.
/// Anything else keeps the default.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => parse_bool(&val).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// String value, or `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

/// Byte size with an optional `K`/`M`/`G` suffix (`"256K"`, `"2M"`)
pub fn env_get_size(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_size(&v))
        .unwrap_or(default)
}

fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, shift) = match s.as_bytes().last()? {
        b'k' | b'K' => (&s[..s.len() - 1], 10),
        b'm' | b'M' => (&s[..s.len() - 1], 20),
        b'g' | b'G' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: usize = digits.parse().ok()?;
    n.checked_mul(1usize << shift)
}

/// Millisecond duration
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns a distinct variable name; the harness runs them in parallel.

    #[test]
    fn test_unset_falls_back() {
        let key = "__STRAND_TEST_UNSET__";
        assert_eq!(env_get::<usize>(key, 42), 42);
        assert!(env_get_opt::<usize>(key).is_none());
        assert!(env_get_bool(key, true));
        assert_eq!(env_get_str(key, "x"), "x");
        assert!(!env_is_set(key));
    }

    #[test]
    fn test_bad_number_keeps_default() {
        std::env::set_var("__STRAND_TEST_BADNUM__", "twelve");
        assert_eq!(env_get::<u64>("__STRAND_TEST_BADNUM__", 7), 7);
        std::env::set_var("__STRAND_TEST_BADNUM__", " 12 ");
        assert_eq!(env_get::<u64>("__STRAND_TEST_BADNUM__", 7), 12);
        std::env::remove_var("__STRAND_TEST_BADNUM__");
    }

    #[test]
    fn test_bool_garbage_keeps_default() {
        std::env::set_var("__STRAND_TEST_BOOL__", "On");
        assert!(env_get_bool("__STRAND_TEST_BOOL__", false));
        std::env::set_var("__STRAND_TEST_BOOL__", "no");
        assert!(!env_get_bool("__STRAND_TEST_BOOL__", true));
        std::env::set_var("__STRAND_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__STRAND_TEST_BOOL__", true));
        std::env::remove_var("__STRAND_TEST_BOOL__");
    }

    #[test]
    fn test_size_suffixes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("256K"), Some(256 * 1024));
        assert_eq!(parse_size("2m"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("M"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_millis() {
        std::env::set_var("__STRAND_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__STRAND_TEST_MS__", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
        std::env::remove_var("__STRAND_TEST_MS__");
    }
}

//! Domain name normalization, reversed-label keys and record identifiers
//!
//! Records are keyed by the A-label form of their name with the labels
//! reversed (`www.example.com` → `com.example.www`). Lexical order then
//! groups a zone's records together, and the wildcard fallback during
//! resolution is a single label replacement at the end of the key stem.
//! Changing any of this breaks wildcard lookup and zone resolution.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::record::RecordType;

/// Separator between the id components inside the encoded tuple.
const ID_SEPARATOR: char = '\x01';

/// Length of the random per-record identifier.
const HID_LEN: usize = 6;

/// Normalize a domain name for storage: trim the root dot, lowercase, and
/// convert any internationalized label to its A-label form.
///
/// Wildcard (`*`) and underscore labels pass through untouched, so ACME
/// challenge names and stored wildcards normalize cleanly. Returns `None`
/// for names that cannot be represented (empty labels, failed IDN mapping).
pub fn normalize_name(name: &str) -> Option<String> {
    let trimmed = name.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    let mut labels = Vec::new();
    for label in trimmed.split('.') {
        if label.is_empty() {
            return None;
        }
        if label.is_ascii() {
            labels.push(label.to_ascii_lowercase());
        } else {
            let ascii = idna::domain_to_ascii(label).ok()?;
            if ascii.is_empty() {
                return None;
            }
            labels.push(ascii);
        }
    }
    Some(labels.join("."))
}

/// Normalize a subdomain prefix. The empty string (zone apex) stays empty.
pub fn normalize_subdomain(subdomain: &str) -> Option<String> {
    let trimmed = subdomain.trim().trim_matches('.');
    if trimmed.is_empty() || trimmed == "@" {
        return Some(String::new());
    }
    normalize_name(trimmed)
}

/// Join a subdomain prefix and a zone into a full name.
pub fn join_name(subdomain: &str, zone: &str) -> String {
    if subdomain.is_empty() {
        zone.to_string()
    } else {
        format!("{}.{}", subdomain, zone)
    }
}

/// Subdomain prefix of `name` relative to `zone`, if `name` is within it.
pub fn subdomain_of<'a>(name: &'a str, zone: &str) -> Option<&'a str> {
    if name == zone {
        return Some("");
    }
    name.strip_suffix(zone)?.strip_suffix('.')
}

/// `www.example.com` → `com.example.www`
pub fn reverse_name(name: &str) -> String {
    let mut labels: Vec<&str> = name.split('.').collect();
    labels.reverse();
    labels.join(".")
}

/// Inverse of [`reverse_name`]; the operation is an involution.
pub fn unreverse_name(reversed: &str) -> String {
    reverse_name(reversed)
}

/// Wildcard form of a query name: the left-most label replaced by `*`.
/// `sub.test.example.com` → `*.test.example.com`. Single-label names have
/// no wildcard form.
pub fn wildcard_name(name: &str) -> Option<String> {
    let (_, rest) = name.split_once('.')?;
    Some(format!("*.{}", rest))
}

/// Storage key of a record hash.
pub fn record_key(reversed_name: &str, rtype: RecordType) -> String {
    format!("d:{}:r:{}", reversed_name, rtype.as_str())
}

/// Storage key of a zone's record index set.
pub fn zone_index_key(reversed_zone: &str) -> String {
    format!("d:{}:z", reversed_zone)
}

/// Parse a record key back into its reversed name and type.
pub fn parse_record_key(key: &str) -> Option<(String, RecordType)> {
    let rest = key.strip_prefix("d:")?;
    let (reversed, type_part) = rest.rsplit_once(":r:")?;
    let rtype = RecordType::from_str(type_part)?;
    Some((reversed.to_string(), rtype))
}

/// Fresh random record identifier, unique within (name, type) for all
/// practical purposes.
pub fn fresh_hid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(HID_LEN)
        .map(char::from)
        .collect()
}

/// Build the external record id: URL-safe base64 (no padding) over
/// `<reversed-name>\x01<TYPE>\x01<hid>`.
pub fn build_id(reversed_name: &str, rtype: RecordType, hid: &str) -> String {
    let raw = format!(
        "{}{}{}{}{}",
        reversed_name,
        ID_SEPARATOR,
        rtype.as_str(),
        ID_SEPARATOR,
        hid
    );
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Parse an external record id back into `(reversed-name, type, hid)`.
/// Malformed input is a logical failure, not an error.
pub fn parse_id(id: &str) -> Option<(String, RecordType, String)> {
    let raw = URL_SAFE_NO_PAD.decode(id.as_bytes()).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let mut parts = raw.splitn(3, ID_SEPARATOR);
    let reversed = parts.next()?;
    let rtype = RecordType::from_str(parts.next()?)?;
    let hid = parts.next()?;
    if reversed.is_empty() || hid.is_empty() {
        return None;
    }
    Some((reversed.to_string(), rtype, hid.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases_and_trims() {
        assert_eq!(
            normalize_name("WWW.Example.COM.").as_deref(),
            Some("www.example.com")
        );
        assert_eq!(normalize_name(""), None);
        assert_eq!(normalize_name("a..b"), None);
    }

    #[test]
    fn test_normalize_idn() {
        assert_eq!(
            normalize_name("bücher.example").as_deref(),
            Some("xn--bcher-kva.example")
        );
    }

    #[test]
    fn test_normalize_keeps_wildcard_and_underscore() {
        assert_eq!(
            normalize_name("*.Example.com").as_deref(),
            Some("*.example.com")
        );
        assert_eq!(
            normalize_name("_acme-challenge.example.com").as_deref(),
            Some("_acme-challenge.example.com")
        );
    }

    #[test]
    fn test_normalize_subdomain() {
        assert_eq!(normalize_subdomain("").as_deref(), Some(""));
        assert_eq!(normalize_subdomain("@").as_deref(), Some(""));
        assert_eq!(normalize_subdomain("WWW").as_deref(), Some("www"));
        assert_eq!(normalize_subdomain("*.Test").as_deref(), Some("*.test"));
    }

    #[test]
    fn test_reverse_roundtrip() {
        assert_eq!(reverse_name("www.example.com"), "com.example.www");
        assert_eq!(unreverse_name("com.example.www"), "www.example.com");
        assert_eq!(reverse_name("example"), "example");
    }

    #[test]
    fn test_wildcard_name() {
        assert_eq!(
            wildcard_name("sub.test.example.com").as_deref(),
            Some("*.test.example.com")
        );
        assert_eq!(wildcard_name("example"), None);
    }

    #[test]
    fn test_record_key_roundtrip() {
        let key = record_key("com.example.www", RecordType::Aaaa);
        assert_eq!(key, "d:com.example.www:r:AAAA");
        let (reversed, rtype) = parse_record_key(&key).unwrap();
        assert_eq!(reversed, "com.example.www");
        assert_eq!(rtype, RecordType::Aaaa);
        assert!(parse_record_key("d:whatever").is_none());
    }

    #[test]
    fn test_id_roundtrip_all_types() {
        for rtype in RecordType::ALL {
            let id = build_id("com.example.www", rtype, "a1B2c3");
            let (reversed, parsed_type, hid) = parse_id(&id).unwrap();
            assert_eq!(reversed, "com.example.www");
            assert_eq!(parsed_type, rtype);
            assert_eq!(hid, "a1B2c3");
        }
    }

    #[test]
    fn test_id_is_url_safe() {
        let id = build_id("com.example.*", RecordType::Cname, "zZ9+x");
        assert!(!id.contains('+'));
        assert!(!id.contains('/'));
        assert!(!id.contains('='));
    }

    #[test]
    fn test_parse_id_rejects_garbage() {
        assert!(parse_id("not base64 at all!!!").is_none());
        let no_separators = URL_SAFE_NO_PAD.encode("plain");
        assert!(parse_id(&no_separators).is_none());
        let bad_type = URL_SAFE_NO_PAD.encode("com.example\x01BOGUS\x01abc");
        assert!(parse_id(&bad_type).is_none());
    }

    #[test]
    fn test_subdomain_of() {
        assert_eq!(subdomain_of("www.example.com", "example.com"), Some("www"));
        assert_eq!(subdomain_of("example.com", "example.com"), Some(""));
        assert_eq!(subdomain_of("example.org", "example.com"), None);
        assert_eq!(subdomain_of("badexample.com", "example.com"), None);
    }

    #[test]
    fn test_fresh_hid_shape() {
        let hid = fresh_hid();
        assert_eq!(hid.len(), 6);
        assert!(hid.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}

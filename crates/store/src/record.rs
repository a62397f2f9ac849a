//! Resource record model
//!
//! Values are stored as JSON arrays whose shape depends on the record type
//! (`["1.2.3.4", "http://check"]` for a health-checked A record,
//! `["mx1.example.com", 10]` for MX, and so on). [`RecordValue`] is the
//! typed view; encoding and decoding are lossless for every valid value.
//! TXT data is an octet string: UTF-8 payloads travel as plain JSON
//! strings, anything else as a `{"base64": ...}` wrapper.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use pendingdns_common::types::HealthState;

/// Longest TXT payload accepted at the store boundary.
pub const TXT_MAX_LEN: usize = 512;

/// The record types the platform serves. `Aname` and `Url` never reach the
/// wire verbatim; they are synthesized into addresses at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Aname,
    Mx,
    Txt,
    Caa,
    Ns,
    Url,
}

impl RecordType {
    /// All types, in the order `list` sorts them.
    pub const ALL: [RecordType; 9] = [
        RecordType::A,
        RecordType::Aaaa,
        RecordType::Aname,
        RecordType::Cname,
        RecordType::Mx,
        RecordType::Txt,
        RecordType::Caa,
        RecordType::Url,
        RecordType::Ns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Aname => "ANAME",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Caa => "CAA",
            RecordType::Ns => "NS",
            RecordType::Url => "URL",
        }
    }

    pub fn from_str(value: &str) -> Option<RecordType> {
        match value.to_ascii_uppercase().as_str() {
            "A" => Some(RecordType::A),
            "AAAA" => Some(RecordType::Aaaa),
            "CNAME" => Some(RecordType::Cname),
            "ANAME" => Some(RecordType::Aname),
            "MX" => Some(RecordType::Mx),
            "TXT" => Some(RecordType::Txt),
            "CAA" => Some(RecordType::Caa),
            "NS" => Some(RecordType::Ns),
            "URL" => Some(RecordType::Url),
            _ => None,
        }
    }

    /// Position in the canonical listing order.
    pub fn sort_rank(&self) -> usize {
        Self::ALL.iter().position(|t| t == self).unwrap_or(usize::MAX)
    }

    pub fn is_address(&self) -> bool {
        matches!(self, RecordType::A | RecordType::Aaaa)
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CAA property tags we accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaaTag {
    Issue,
    IssueWild,
    Iodef,
}

impl CaaTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaaTag::Issue => "issue",
            CaaTag::IssueWild => "issuewild",
            CaaTag::Iodef => "iodef",
        }
    }

    pub fn from_str(value: &str) -> Option<CaaTag> {
        match value {
            "issue" => Some(CaaTag::Issue),
            "issuewild" => Some(CaaTag::IssueWild),
            "iodef" => Some(CaaTag::Iodef),
            _ => None,
        }
    }
}

/// Typed record value. The JSON tuple shape is the storage format; see the
/// per-variant `to_json` arms.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    A {
        address: String,
        health_check: Option<String>,
    },
    Aaaa {
        address: String,
        health_check: Option<String>,
    },
    Cname {
        target: String,
    },
    Aname {
        target: String,
    },
    Mx {
        exchange: String,
        priority: u16,
    },
    Txt {
        data: Vec<u8>,
    },
    Caa {
        value: String,
        tag: CaaTag,
        flags: u8,
    },
    Ns {
        ns: String,
    },
    Url {
        url: String,
        status_code: u16,
        proxy: bool,
    },
}

impl RecordValue {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordValue::A { .. } => RecordType::A,
            RecordValue::Aaaa { .. } => RecordType::Aaaa,
            RecordValue::Cname { .. } => RecordType::Cname,
            RecordValue::Aname { .. } => RecordType::Aname,
            RecordValue::Mx { .. } => RecordType::Mx,
            RecordValue::Txt { .. } => RecordType::Txt,
            RecordValue::Caa { .. } => RecordType::Caa,
            RecordValue::Ns { .. } => RecordType::Ns,
            RecordValue::Url { .. } => RecordType::Url,
        }
    }

    /// Health-check URI carried by an address record, if any.
    pub fn health_check_uri(&self) -> Option<&str> {
        match self {
            RecordValue::A { health_check, .. } | RecordValue::Aaaa { health_check, .. } => {
                health_check.as_deref().filter(|uri| !uri.is_empty())
            }
            _ => None,
        }
    }

    /// Storage form: a JSON array shaped by type.
    pub fn to_json(&self) -> Value {
        match self {
            RecordValue::A {
                address,
                health_check,
            }
            | RecordValue::Aaaa {
                address,
                health_check,
            } => match health_check {
                Some(uri) => json!([address, uri]),
                None => json!([address]),
            },
            RecordValue::Cname { target } | RecordValue::Aname { target } => json!([target]),
            RecordValue::Mx { exchange, priority } => json!([exchange, priority]),
            RecordValue::Txt { data } => json!([txt_json(data)]),
            RecordValue::Caa { value, tag, flags } => json!([value, tag.as_str(), flags]),
            RecordValue::Ns { ns } => json!([ns]),
            RecordValue::Url {
                url,
                status_code,
                proxy,
            } => json!([url, status_code, proxy]),
        }
    }

    /// Decode a stored JSON tuple for a known record type. Shape violations
    /// are logical failures (`None`), never errors.
    pub fn from_json(rtype: RecordType, value: &Value) -> Option<RecordValue> {
        let tuple = value.as_array()?;
        let text = |idx: usize| tuple.get(idx).and_then(Value::as_str).map(str::to_string);

        match rtype {
            RecordType::A | RecordType::Aaaa => {
                let address = text(0)?;
                let health_check = text(1).filter(|uri| !uri.is_empty());
                Some(if rtype == RecordType::A {
                    RecordValue::A {
                        address,
                        health_check,
                    }
                } else {
                    RecordValue::Aaaa {
                        address,
                        health_check,
                    }
                })
            }
            RecordType::Cname => Some(RecordValue::Cname { target: text(0)? }),
            RecordType::Aname => Some(RecordValue::Aname { target: text(0)? }),
            RecordType::Mx => {
                let exchange = text(0)?;
                let priority = tuple.get(1)?.as_u64()?;
                if !(1..=255).contains(&priority) {
                    return None;
                }
                Some(RecordValue::Mx {
                    exchange,
                    priority: priority as u16,
                })
            }
            RecordType::Txt => {
                let data = txt_bytes(tuple.first()?)?;
                if data.len() > TXT_MAX_LEN {
                    return None;
                }
                Some(RecordValue::Txt { data })
            }
            RecordType::Caa => {
                let value = text(0)?;
                let tag = CaaTag::from_str(&text(1)?)?;
                let flags = tuple.get(2)?.as_u64()?;
                if flags > u8::MAX as u64 {
                    return None;
                }
                Some(RecordValue::Caa {
                    value,
                    tag,
                    flags: flags as u8,
                })
            }
            RecordType::Ns => Some(RecordValue::Ns { ns: text(0)? }),
            RecordType::Url => {
                let url = text(0)?;
                let status_code = tuple
                    .get(1)
                    .and_then(Value::as_u64)
                    .unwrap_or(301);
                if !matches!(status_code, 301 | 302 | 303 | 307 | 308) {
                    return None;
                }
                let proxy = tuple.get(2).and_then(Value::as_bool).unwrap_or(false);
                Some(RecordValue::Url {
                    url,
                    status_code: status_code as u16,
                    proxy,
                })
            }
        }
    }

    /// Map the internal tuple to the REST shape. Pure.
    pub fn format_value(&self) -> Value {
        match self {
            RecordValue::A {
                address,
                health_check,
            }
            | RecordValue::Aaaa {
                address,
                health_check,
            } => match health_check {
                Some(uri) => json!({ "address": address, "healthCheck": uri }),
                None => json!({ "address": address }),
            },
            RecordValue::Cname { target } | RecordValue::Aname { target } => {
                json!({ "target": target })
            }
            RecordValue::Mx { exchange, priority } => {
                json!({ "exchange": exchange, "priority": priority })
            }
            RecordValue::Txt { data } => json!({ "data": txt_json(data) }),
            RecordValue::Caa { value, tag, flags } => {
                json!({ "value": value, "tag": tag.as_str(), "flags": flags })
            }
            RecordValue::Ns { ns } => json!({ "ns": ns }),
            RecordValue::Url {
                url,
                status_code,
                proxy,
            } => json!({ "url": url, "statusCode": status_code, "proxy": proxy }),
        }
    }
}

/// JSON form of a TXT octet string: a plain string for UTF-8 payloads,
/// a `{"base64": ...}` wrapper for anything else.
fn txt_json(data: &[u8]) -> Value {
    match std::str::from_utf8(data) {
        Ok(text) => json!(text),
        Err(_) => json!({ "base64": STANDARD.encode(data) }),
    }
}

/// Inverse of [`txt_json`]. Shape violations are `None`.
fn txt_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(text) => Some(text.clone().into_bytes()),
        Value::Object(wrapper) => {
            let encoded = wrapper.get("base64")?.as_str()?;
            STANDARD.decode(encoded).ok()
        }
        _ => None,
    }
}

/// A record as handed to callers of `list`/`resolve`.
///
/// In short mode (hot query paths) the `zone`, `subdomain` and `id` fields
/// stay unset; they are not needed to build an answer.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// Full name (A-label form).
    pub name: String,
    pub rtype: RecordType,
    pub value: RecordValue,
    pub hid: String,
    /// External identifier; `None` in short mode.
    pub id: Option<String>,
    /// Zone apex; `None` in short mode.
    pub zone: Option<String>,
    /// Prefix relative to the zone; `None` in short mode.
    pub subdomain: Option<String>,
    /// Wildcard name that matched, when this row came from a wildcard key.
    pub wildcard: Option<String>,
    /// Current probe status for health-checked address records.
    pub health: Option<HealthState>,
}

impl StoredRecord {
    /// REST-facing representation of a full (non-short) row.
    pub fn format(&self) -> Value {
        let mut body = self.value.format_value();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("type".to_string(), json!(self.rtype.as_str()));
            obj.insert("name".to_string(), json!(self.name));
            if let Some(id) = &self.id {
                obj.insert("id".to_string(), json!(id));
            }
            if let Some(zone) = &self.zone {
                obj.insert("zone".to_string(), json!(zone));
            }
            if let Some(subdomain) = &self.subdomain {
                obj.insert("subdomain".to_string(), json!(subdomain));
            }
            if let Some(health) = &self.health {
                obj.insert("health".to_string(), json!(health));
            }
            if let Some(wildcard) = &self.wildcard {
                obj.insert("wildcard".to_string(), json!(wildcard));
            }
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_json_roundtrip() {
        let values = vec![
            RecordValue::A {
                address: "192.0.2.1".into(),
                health_check: Some("tcp://192.0.2.1:443".into()),
            },
            RecordValue::Aaaa {
                address: "2001:db8::1".into(),
                health_check: None,
            },
            RecordValue::Cname { target: "@".into() },
            RecordValue::Aname {
                target: "origin.example.net".into(),
            },
            RecordValue::Mx {
                exchange: "mx1.example.com".into(),
                priority: 10,
            },
            RecordValue::Txt {
                data: b"v=spf1 -all".to_vec(),
            },
            RecordValue::Caa {
                value: "letsencrypt.org".into(),
                tag: CaaTag::Issue,
                flags: 0,
            },
            RecordValue::Ns {
                ns: "ns1.example.com".into(),
            },
            RecordValue::Url {
                url: "https://example.net/".into(),
                status_code: 302,
                proxy: false,
            },
        ];

        for value in values {
            let rtype = value.rtype();
            let json = value.to_json();
            let back = RecordValue::from_json(rtype, &json).unwrap();
            assert_eq!(value, back, "roundtrip for {}", rtype);
        }
    }

    #[test]
    fn test_mx_priority_bounds() {
        assert!(RecordValue::from_json(RecordType::Mx, &json!(["mx", 0])).is_none());
        assert!(RecordValue::from_json(RecordType::Mx, &json!(["mx", 256])).is_none());
        assert!(RecordValue::from_json(RecordType::Mx, &json!(["mx", 255])).is_some());
    }

    #[test]
    fn test_url_status_codes() {
        for code in [301, 302, 303, 307, 308] {
            assert!(
                RecordValue::from_json(RecordType::Url, &json!(["https://x", code, true]))
                    .is_some()
            );
        }
        assert!(RecordValue::from_json(RecordType::Url, &json!(["https://x", 200])).is_none());
    }

    #[test]
    fn test_url_defaults() {
        let value = RecordValue::from_json(RecordType::Url, &json!(["https://x"])).unwrap();
        assert_eq!(
            value,
            RecordValue::Url {
                url: "https://x".into(),
                status_code: 301,
                proxy: false
            }
        );
    }

    #[test]
    fn test_txt_length_cap_is_in_bytes() {
        let long = "x".repeat(TXT_MAX_LEN + 1);
        assert!(RecordValue::from_json(RecordType::Txt, &json!([long])).is_none());
        let max = "x".repeat(TXT_MAX_LEN);
        assert!(RecordValue::from_json(RecordType::Txt, &json!([max])).is_some());

        // Multi-byte characters count by encoded length, not chars.
        let two_byte = "é".repeat(TXT_MAX_LEN / 2 + 1);
        assert!(RecordValue::from_json(RecordType::Txt, &json!([two_byte])).is_none());
    }

    #[test]
    fn test_txt_text_payload_stays_a_plain_string() {
        let value = RecordValue::Txt {
            data: "über alles".as_bytes().to_vec(),
        };
        assert_eq!(value.to_json(), json!(["über alles"]));
        assert_eq!(
            RecordValue::from_json(RecordType::Txt, &value.to_json()).unwrap(),
            value
        );
        assert_eq!(value.format_value(), json!({ "data": "über alles" }));
    }

    #[test]
    fn test_txt_binary_payload_roundtrips_via_base64() {
        let data = vec![0xff, 0x00, 0x80, 0xfe, 0x01];
        let value = RecordValue::Txt { data: data.clone() };

        let encoded = value.to_json();
        assert!(encoded[0].get("base64").is_some());

        let back = RecordValue::from_json(RecordType::Txt, &encoded).unwrap();
        assert_eq!(back, RecordValue::Txt { data });
    }

    #[test]
    fn test_empty_health_uri_is_none() {
        let value = RecordValue::from_json(RecordType::A, &json!(["192.0.2.1", ""])).unwrap();
        assert!(value.health_check_uri().is_none());
    }

    #[test]
    fn test_sort_rank_order() {
        assert!(RecordType::A.sort_rank() < RecordType::Aaaa.sort_rank());
        assert!(RecordType::Aname.sort_rank() < RecordType::Cname.sort_rank());
        assert!(RecordType::Url.sort_rank() < RecordType::Ns.sort_rank());
    }

    #[test]
    fn test_format_value_shapes() {
        let mx = RecordValue::Mx {
            exchange: "mx1".into(),
            priority: 5,
        };
        assert_eq!(
            mx.format_value(),
            json!({"exchange": "mx1", "priority": 5})
        );

        let url = RecordValue::Url {
            url: "https://t".into(),
            status_code: 308,
            proxy: true,
        };
        assert_eq!(
            url.format_value(),
            json!({"url": "https://t", "statusCode": 308, "proxy": true})
        );
    }

    #[test]
    fn test_caa_tag_parse() {
        assert_eq!(CaaTag::from_str("issuewild"), Some(CaaTag::IssueWild));
        assert_eq!(CaaTag::from_str("unknown"), None);
    }

    #[test]
    fn test_stored_record_format() {
        let record = StoredRecord {
            name: "www.example.com".into(),
            rtype: RecordType::A,
            value: RecordValue::A {
                address: "192.0.2.1".into(),
                health_check: Some("tcp://192.0.2.1:80".into()),
            },
            hid: "h1".into(),
            id: Some("some-id".into()),
            zone: Some("example.com".into()),
            subdomain: Some("www".into()),
            wildcard: None,
            health: Some(HealthState::up()),
        };
        let body = record.format();
        assert_eq!(body["type"], "A");
        assert_eq!(body["name"], "www.example.com");
        assert_eq!(body["address"], "192.0.2.1");
        assert_eq!(body["healthCheck"], "tcp://192.0.2.1:80");
        assert_eq!(body["zone"], "example.com");
        assert_eq!(body["subdomain"], "www");
        assert_eq!(body["health"]["status"], true);
        assert!(body.get("wildcard").is_none());
    }
}

//! # Payload Scanning Utilities
//!
//! This module provides helper functions for pulling individual fields out
//! of the small JSON documents the provisioning service exchanges, without
//! a full JSON parser. The scanner is deliberately minimal: it locates a
//! quoted key at any nesting depth and reads the value after the colon.
//!
//! This is a field scanner, not a validator. Provisioning documents are
//! machine-generated and their interesting fields (ids, hostnames, status
//! words) never contain escaped quotes, so escape sequences are not
//! handled.

/// Finds `"key":` in `doc` and returns the index of the first byte of the
/// value (after the colon and any whitespace).
fn find_value(doc: &str, key: &str) -> Option<usize> {
    let bytes = doc.as_bytes();
    let mut from = 0;
    while let Some(pos) = doc[from..].find(key) {
        let at = from + pos;
        let end = at + key.len();
        // The match only counts when it is a whole quoted key.
        if at >= 1 && bytes[at - 1] == b'"' && bytes.get(end) == Some(&b'"') {
            let mut i = end + 1;
            while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
                i += 1;
            }
            if bytes.get(i) == Some(&b':') {
                let mut v = i + 1;
                while bytes.get(v).is_some_and(|b| b.is_ascii_whitespace()) {
                    v += 1;
                }
                return Some(v);
            }
        }
        from = end;
    }
    None
}

/// Reads the string value of `key`, borrowed from `doc`.
///
/// Returns `None` when the key is absent or its value is not a string.
pub fn json_str_field<'a>(doc: &'a str, key: &str) -> Option<&'a str> {
    let v = find_value(doc, key)?;
    if doc.as_bytes().get(v) != Some(&b'"') {
        return None;
    }
    let start = v + 1;
    let end = start + doc[start..].find('"')?;
    Some(&doc[start..end])
}

/// Reads the unsigned integer value of `key`.
///
/// Returns `None` when the key is absent or its value does not start with a
/// digit.
pub fn json_u32_field(doc: &str, key: &str) -> Option<u32> {
    let v = find_value(doc, key)?;
    let bytes = doc.as_bytes();
    let mut end = v;
    while bytes.get(end).is_some_and(|b| b.is_ascii_digit()) {
        end += 1;
    }
    if end == v {
        return None;
    }
    doc[v..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_top_level_string_field() {
        let doc = r#"{"operationId":"op123","status":"assigning"}"#;
        assert_eq!(json_str_field(doc, "operationId"), Some("op123"));
        assert_eq!(json_str_field(doc, "status"), Some("assigning"));
    }

    #[test]
    fn reads_nested_string_field() {
        let doc = r#"{"registrationState":{"assignedHub":"hub.example.net"}}"#;
        assert_eq!(json_str_field(doc, "assignedHub"), Some("hub.example.net"));
    }

    #[test]
    fn tolerates_whitespace_around_colon() {
        let doc = r#"{ "status" : "failed" }"#;
        assert_eq!(json_str_field(doc, "status"), Some("failed"));
    }

    #[test]
    fn missing_key_returns_none() {
        let doc = r#"{"status":"assigning"}"#;
        assert_eq!(json_str_field(doc, "operationId"), None);
    }

    #[test]
    fn substring_of_another_key_does_not_match() {
        // "status" occurs inside "operationStatus" but is not a key there.
        let doc = r#"{"operationStatus":"assigned"}"#;
        assert_eq!(json_str_field(doc, "status"), None);
    }

    #[test]
    fn key_in_string_value_does_not_match() {
        let doc = r#"{"message":"status","status":"failed"}"#;
        assert_eq!(json_str_field(doc, "status"), Some("failed"));
    }

    #[test]
    fn reads_number_field() {
        let doc = r#"{"errorCode":400207,"message":"bad"}"#;
        assert_eq!(json_u32_field(doc, "errorCode"), Some(400207));
    }

    #[test]
    fn number_field_rejects_non_digit_value() {
        let doc = r#"{"errorCode":"nope"}"#;
        assert_eq!(json_u32_field(doc, "errorCode"), None);
    }
}

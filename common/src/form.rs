use std::collections::HashMap;

use url::form_urlencoded;

/// Decodes an `application/x-www-form-urlencoded` body or query string.
/// Later duplicates win.
pub fn parse_urlencoded(text: &str) -> HashMap<String, String> {
    form_urlencoded::parse(text.as_bytes()).into_owned().collect()
}

/// Value of `key` in the query part of `uri`.
pub fn query_param(uri: &str, key: &str) -> Option<String> {
    let (_, query) = uri.split_once('?')?;
    form_urlencoded::parse(query.as_bytes())
        .filter(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_form_body() {
        let form = parse_urlencoded("label0=Fibre+Modem&ip0=192.168.1.1&ping0=on&globalOnTime=22%3A00");

        assert_eq!(form.get("label0").map(String::as_str), Some("Fibre Modem"));
        assert_eq!(form.get("ip0").map(String::as_str), Some("192.168.1.1"));
        assert_eq!(form.get("ping0").map(String::as_str), Some("on"));
        assert_eq!(form.get("globalOnTime").map(String::as_str), Some("22:00"));
    }

    #[test]
    fn keeps_malformed_escapes_literally() {
        // Percent signs not followed by two hex digits are not escapes.
        let form = parse_urlencoded("a=100%&b=%zz&c");
        assert_eq!(form.get("a").map(String::as_str), Some("100%"));
        assert_eq!(form.get("b").map(String::as_str), Some("%zz"));
        assert_eq!(form.get("c").map(String::as_str), Some(""));
    }

    #[test]
    fn reads_query_parameter() {
        assert_eq!(query_param("/toggle?id=3", "id").as_deref(), Some("3"));
        assert_eq!(query_param("/toggle", "id"), None);
        assert_eq!(query_param("/toggle?x=1", "id"), None);
        assert_eq!(query_param("/toggle?id=1&id=4", "id").as_deref(), Some("4"));
    }
}

//! Hierarchical `<property>` lookup and CSS2-style time values.

use std::time::Duration;

use crate::document::{Document, NodeId};

/// Nearest `<property name=...>` declared on `from` or an ancestor.
pub fn lookup<'a>(doc: &'a Document, from: NodeId, name: &str) -> Option<&'a str> {
    doc.ancestors_inclusive(from).find_map(|scope| {
        doc.children_tagged(scope, "property")
            .find(|&p| doc.attr(p, "name") == name)
            .map(|p| doc.attr(p, "value"))
    })
}

/// `"5s"`, `"250ms"`, `"1.5s"`; a bare number is milliseconds.
pub fn parse_time(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (number, scale) = if let Some(ms) = raw.strip_suffix("ms") {
        (ms, 1.0)
    } else if let Some(s) = raw.strip_suffix('s') {
        (s, 1000.0)
    } else {
        (raw, 1.0)
    };
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(Duration::from_micros((value * scale * 1000.0).round() as u64))
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// `<break strength>` durations.
pub fn break_strength(raw: &str) -> Duration {
    let ms = match raw.trim() {
        "none" => 0,
        "x-weak" => 100,
        "weak" => 250,
        "strong" => 1000,
        "x-strong" => 2000,
        _ => 500,
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NodeSpec;

    #[test]
    fn nearest_declaration_wins() {
        let spec = NodeSpec::element(
            "vxml",
            &[],
            vec![
                NodeSpec::element("property", &[("name", "timeout"), ("value", "9s")], vec![]),
                NodeSpec::element(
                    "form",
                    &[],
                    vec![
                        NodeSpec::element("property", &[("name", "timeout"), ("value", "2s")], vec![]),
                        NodeSpec::element("field", &[("name", "f")], vec![]),
                    ],
                ),
            ],
        );
        let doc = Document::from_spec("mem:p", &spec).unwrap();
        let field = doc.find_item(doc.root(), "f").unwrap();
        assert_eq!(lookup(&doc, field, "timeout"), Some("2s"));
        assert_eq!(lookup(&doc, doc.root(), "timeout"), Some("9s"));
        assert_eq!(lookup(&doc, field, "termchar"), None);
    }

    #[test]
    fn time_values() {
        assert_eq!(parse_time("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_time("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_time("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_time("300"), Some(Duration::from_millis(300)));
        assert_eq!(parse_time("soon"), None);
        assert_eq!(parse_time("-1s"), None);
    }

    #[test]
    fn booleans_and_strengths() {
        assert_eq!(parse_bool(" TRUE "), Some(true));
        assert_eq!(parse_bool("yes"), None);
        assert_eq!(break_strength("x-strong"), Duration::from_secs(2));
        assert_eq!(break_strength(""), Duration::from_millis(500));
    }
}

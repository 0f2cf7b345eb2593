use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::warn;

/// Containers nested deeper than this pass through unmasked; result sets from
/// the database never approach this shape, and masking must never fail.
const MAX_DEPTH: usize = 64;

/// A pattern class with its redaction strategy. Rules are built once at
/// startup and applied in a fixed priority order; every replacement is chosen
/// so that re-masking produces no further change.
struct MaskingRule {
    name: &'static str,
    pattern: Regex,
    redact: fn(&Captures) -> String,
}

fn rules() -> &'static [MaskingRule] {
    static RULES: OnceLock<Vec<MaskingRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            // Email before generic digit patterns; keeps a short local-part
            // hint and the domain.
            MaskingRule {
                name: "email",
                pattern: Regex::new(
                    r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
                )
                .unwrap(),
                redact: |caps| {
                    let full = &caps[0];
                    let (local, domain) = full.split_once('@').unwrap_or((full, ""));
                    let keep = local.chars().take(3).collect::<String>();
                    format!("{keep}***@{domain}")
                },
            },
            // Card before phone so a 16-digit number is not half-matched as a
            // phone number; keeps the last four digits.
            MaskingRule {
                name: "card_number",
                pattern: Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?(\d{4})\b").unwrap(),
                redact: |caps| format!("****-****-****-{}", &caps[1]),
            },
            MaskingRule {
                name: "ssn",
                pattern: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
                redact: |_| "***-**-****".to_string(),
            },
            MaskingRule {
                name: "phone",
                pattern: Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?(\d{4})\b").unwrap(),
                redact: |caps| format!("***-***-{}", &caps[1]),
            },
            // Progressive octet masking keeps the network prefix readable.
            MaskingRule {
                name: "ip_address",
                pattern: Regex::new(r"\b(\d{1,3})\.(\d{1,3})\.\d{1,3}\.\d{1,3}\b").unwrap(),
                redact: |caps| format!("{}.{}.*.*", &caps[1], &caps[2]),
            },
        ]
    })
}

/// Redact sensitive fragments of a single string.
pub fn mask_text(text: &str) -> String {
    let mut masked = text.to_string();
    for rule in rules() {
        if rule.pattern.is_match(&masked) {
            masked = rule
                .pattern
                .replace_all(&masked, |caps: &Captures| (rule.redact)(caps))
                .into_owned();
        }
    }
    masked
}

/// Recursively redact sensitive string leaves of a result value.
///
/// Mapping keys are never altered; null, boolean and numeric leaves pass
/// through untouched. Total: masking never fails the caller.
pub fn mask(value: Value) -> Value {
    mask_at(value, 0)
}

fn mask_at(value: Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        warn!(depth = depth, "result nesting exceeds masking depth cap; passing through");
        return value;
    }
    match value {
        Value::String(s) => Value::String(mask_text(&s)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| mask_at(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, mask_at(item, depth + 1)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_email_keeping_domain() {
        assert_eq!(mask_text("contact user@example.com now"), "contact use***@example.com now");
        // Short local parts keep what they have.
        assert_eq!(mask_text("ab@example.com"), "ab***@example.com");
    }

    #[test]
    fn masks_card_before_phone() {
        assert_eq!(
            mask_text("card 4111-1111-1111-1234"),
            "card ****-****-****-1234"
        );
        assert_eq!(
            mask_text("card 4111111111111234"),
            "card ****-****-****-1234"
        );
    }

    #[test]
    fn masks_phone_keeping_last_four() {
        assert_eq!(mask_text("call 555-867-5309"), "call ***-***-5309");
        assert_eq!(mask_text("call 5558675309"), "call ***-***-5309");
    }

    #[test]
    fn masks_ssn_fully() {
        assert_eq!(mask_text("ssn 123-45-6789"), "ssn ***-**-****");
    }

    #[test]
    fn masks_ip_progressively() {
        assert_eq!(mask_text("peer 10.129.42.7"), "peer 10.129.*.*");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(mask_text("42 incidents in namespace prod"), "42 incidents in namespace prod");
    }

    #[test]
    fn masking_text_is_idempotent() {
        for sample in [
            "user@example.com",
            "4111-1111-1111-1234",
            "555-867-5309",
            "123-45-6789",
            "10.129.42.7",
            "mixed user@example.com from 10.0.0.1 card 4111111111111234",
        ] {
            let once = mask_text(sample);
            assert_eq!(mask_text(&once), once, "not idempotent for {sample}");
        }
    }

    #[test]
    fn masks_nested_values_and_spares_siblings() {
        let input = json!({
            "rows": [
                {"assignee": "user@example.com", "count": 7, "open": true},
                {"assignee": null, "reporter_ip": "192.168.3.44"}
            ],
            "total": 2
        });
        let masked = mask(input);
        assert_eq!(masked["rows"][0]["assignee"], "use***@example.com");
        assert_eq!(masked["rows"][0]["count"], 7);
        assert_eq!(masked["rows"][0]["open"], true);
        assert_eq!(masked["rows"][1]["assignee"], Value::Null);
        assert_eq!(masked["rows"][1]["reporter_ip"], "192.168.*.*");
        assert_eq!(masked["total"], 2);
    }

    #[test]
    fn keys_are_never_masked() {
        let input = json!({"user@example.com": "user@example.com"});
        let masked = mask(input);
        let map = masked.as_object().unwrap();
        assert!(map.contains_key("user@example.com"));
        assert_eq!(map["user@example.com"], "use***@example.com");
    }

    #[test]
    fn mask_value_is_idempotent() {
        let input = json!({
            "contacts": ["a@b.io", {"phone": "555-867-5309"}],
            "meta": {"ips": ["10.0.0.1", "172.16.9.3"]}
        });
        let once = mask(input);
        let twice = mask(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn depth_cap_passes_value_through() {
        let mut value = json!("user@example.com");
        for _ in 0..(MAX_DEPTH + 8) {
            value = json!([value]);
        }
        // Too deep to reach the leaf; the shell comes back structurally
        // intact rather than erroring.
        let masked = mask(value.clone());
        assert_eq!(masked, value);
    }
}

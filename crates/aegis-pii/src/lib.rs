//! Detection and masking of sensitive substrings in free-form text, with a
//! tree walker that applies the same scan recursively over nested JSON
//! parameters and context maps.
//!
//! There is no NLP-backed detector in this crate's dependency stack, so
//! entity recognition is regex-only. That covers the entity types a
//! fallback scanner must catch (`EMAIL_ADDRESS`, `US_SSN`,
//! `PHONE_NUMBER`, `CREDIT_CARD`, `IP_ADDRESS`) plus a few more that are
//! reliably pattern-shaped (`URL`, `IBAN_CODE`, `CRYPTO`). Entity types that
//! genuinely require named-entity recognition (`PERSON`, `US_BANK_NUMBER`,
//! `US_PASSPORT`, `US_DRIVER_LICENSE`, `MEDICAL_LICENSE`) are part of the
//! taxonomy but never matched by this scanner.

#![deny(unsafe_code)]

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

/// Replacement used for every matched span, regardless of entity type.
pub const MASK: &str = "********";

/// The full entity taxonomy this scanner can express, not all of which it
/// can actually detect (see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Person,
    EmailAddress,
    PhoneNumber,
    UsSsn,
    CreditCard,
    UsBankNumber,
    IpAddress,
    UsPassport,
    UsDriverLicense,
    Crypto,
    IbanCode,
    MedicalLicense,
    Url,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Person => "PERSON",
            Self::EmailAddress => "EMAIL_ADDRESS",
            Self::PhoneNumber => "PHONE_NUMBER",
            Self::UsSsn => "US_SSN",
            Self::CreditCard => "CREDIT_CARD",
            Self::UsBankNumber => "US_BANK_NUMBER",
            Self::IpAddress => "IP_ADDRESS",
            Self::UsPassport => "US_PASSPORT",
            Self::UsDriverLicense => "US_DRIVER_LICENSE",
            Self::Crypto => "CRYPTO",
            Self::IbanCode => "IBAN_CODE",
            Self::MedicalLicense => "MEDICAL_LICENSE",
            Self::Url => "URL",
        };
        f.write_str(s)
    }
}

struct Pattern {
    entity: EntityType,
    re: Regex,
}

// Order matters: more specific patterns run before looser ones so a credit
// card number isn't partially swallowed by a looser digit-run pattern first.
static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        Pattern {
            entity: EntityType::EmailAddress,
            re: Regex::new(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b").unwrap(),
        },
        Pattern {
            entity: EntityType::Url,
            re: Regex::new(r"(?i)\bhttps?://[^\s]+\b").unwrap(),
        },
        Pattern {
            entity: EntityType::UsSsn,
            re: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
        },
        Pattern {
            entity: EntityType::CreditCard,
            re: Regex::new(r"\b(?:\d[ -]?){13,16}\b").unwrap(),
        },
        Pattern {
            entity: EntityType::IbanCode,
            re: Regex::new(r"\b[A-Z]{2}\d{2}[A-Z0-9]{10,30}\b").unwrap(),
        },
        Pattern {
            entity: EntityType::PhoneNumber,
            re: Regex::new(r"\b(?:\+?1[-. ]?)?\(?\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b").unwrap(),
        },
        Pattern {
            entity: EntityType::IpAddress,
            re: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
        },
        Pattern {
            entity: EntityType::Crypto,
            re: Regex::new(r"\b(?:bc1[a-z0-9]{25,39}|[13][a-km-zA-HJ-NP-Z1-9]{25,34}|0x[a-fA-F0-9]{40})\b").unwrap(),
        },
    ]
});

/// Scan a single string for every recognized entity type and mask matches.
///
/// Returns the masked string and the distinct entity types found, in the
/// order the patterns are tried. If nothing is recognized the string is
/// returned unchanged and the type list is empty. Masking is idempotent:
/// scanning an already-masked string finds nothing new, since `MASK` itself
/// matches none of the patterns above.
#[must_use]
pub fn scan_text(s: &str) -> (String, Vec<EntityType>) {
    let mut masked = s.to_string();
    let mut found = Vec::new();
    for pattern in PATTERNS.iter() {
        if pattern.re.is_match(&masked) {
            masked = pattern.re.replace_all(&masked, MASK).into_owned();
            found.push(pattern.entity);
        }
    }
    (masked, found)
}

/// Recursively walk a JSON value, scanning string leaves and leaving every
/// other leaf (number, bool, null) and the shape of maps/arrays untouched.
///
/// `serde_json::Map` preserves insertion order when the `preserve_order`
/// feature is enabled, so object key order and array length/order survive
/// the walk unchanged.
#[must_use]
pub fn scan_tree(value: &JsonValue) -> (JsonValue, Vec<EntityType>) {
    let mut found = Vec::new();
    let masked = walk(value, &mut found);
    found.sort_unstable();
    found.dedup();
    (masked, found)
}

fn walk(value: &JsonValue, found: &mut Vec<EntityType>) -> JsonValue {
    match value {
        JsonValue::String(s) => {
            let (masked, entities) = scan_text(s);
            found.extend(entities);
            JsonValue::String(masked)
        }
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|item| walk(item, found)).collect())
        }
        JsonValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(key.clone(), walk(val, found));
            }
            JsonValue::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_text_finds_email_and_ssn() {
        let (masked, entities) = scan_text("contact a@b.com, ssn 123-45-6789");
        assert!(!masked.contains("a@b.com"));
        assert!(!masked.contains("123-45-6789"));
        assert!(entities.contains(&EntityType::EmailAddress));
        assert!(entities.contains(&EntityType::UsSsn));
    }

    #[test]
    fn scan_text_leaves_clean_strings_alone() {
        let (masked, entities) = scan_text("just a normal description");
        assert_eq!(masked, "just a normal description");
        assert!(entities.is_empty());
    }

    #[test]
    fn scan_text_is_idempotent() {
        let (once, _) = scan_text("email me at a@b.com");
        let (twice, entities_twice) = scan_text(&once);
        assert_eq!(once, twice);
        assert!(entities_twice.is_empty());
    }

    #[test]
    fn scan_tree_preserves_shape_and_key_order() {
        let value = serde_json::json!({
            "z_first": "a@b.com",
            "a_second": 42,
            "list": ["192.168.1.1", "clean", null],
        });
        let (masked, entities) = scan_tree(&value);
        let obj = masked.as_object().unwrap();
        let keys: Vec<&String> = obj.keys().collect();
        assert_eq!(keys, vec!["z_first", "a_second", "list"]);
        assert_eq!(obj["a_second"], serde_json::json!(42));
        let list = obj["list"].as_array().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[1], serde_json::json!("clean"));
        assert_eq!(list[2], JsonValue::Null);
        assert!(entities.contains(&EntityType::EmailAddress));
        assert!(entities.contains(&EntityType::IpAddress));
    }

    #[test]
    fn scan_tree_dedupes_entity_types_across_leaves() {
        let value = serde_json::json!({"a": "a@b.com", "b": "c@d.com"});
        let (_, entities) = scan_tree(&value);
        assert_eq!(entities.iter().filter(|e| **e == EntityType::EmailAddress).count(), 1);
    }
}

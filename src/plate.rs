//! Plate string stages
//!
//! Assembly of classified symbols, position-dependent confusion correction
//! and the national format grammar (two letters, four digits, two letters).

use anyhow::{ensure, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Plate text reported when no plate region was found
pub const NOT_RECOGNIZED: &str = "NOT RECOGNIZED";

/// Length of a plate string in the national format
pub const PLATE_LEN: usize = 8;

/// Positions that must hold letters
pub const LETTER_SLOTS: [usize; 4] = [0, 1, 6, 7];

/// Positions that must hold digits
pub const DIGIT_SLOTS: [usize; 4] = [2, 3, 4, 5];

// ASCII classes only; `\d` would also accept non-ASCII digits.
static PLATE_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z]{2}[0-9]{4}[A-Z]{2}$")
        .unwrap_or_else(|e| panic!("Failed to compile plate format pattern: {e}"))
});

/// Concatenate classified symbols in sequence order
pub fn assemble(symbols: &[char]) -> String {
    symbols.iter().collect()
}

/// Whether `text` matches the national plate grammar
pub fn is_valid(text: &str) -> bool {
    PLATE_FORMAT.is_match(text)
}

/// Substitution tables for commonly confused glyph pairs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionTables {
    /// Applied at letter positions
    #[serde(with = "symbol_map")]
    pub letters: BTreeMap<char, char>,
    /// Applied at digit positions
    #[serde(with = "symbol_map")]
    pub digits: BTreeMap<char, char>,
}

/// Symbol tables keyed by single-character strings
///
/// TOML only allows string keys.
mod symbol_map {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<char, char>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(from, to)| (from.to_string(), to)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<char, char>, D::Error>
    where
        D: Deserializer<'de>,
    {
        BTreeMap::<String, char>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, to)| {
                let mut chars = key.chars();
                match (chars.next(), chars.next()) {
                    (Some(from), None) => Ok((from, to)),
                    _ => Err(D::Error::custom(format!(
                        "table key {key:?} is not a single symbol"
                    ))),
                }
            })
            .collect()
    }
}

impl Default for CorrectionTables {
    fn default() -> Self {
        Self {
            letters: [
                ('1', 'I'),
                ('i', 'I'),
                ('|', 'I'),
                ('0', 'O'),
                ('7', 'Z'),
                ('8', 'B'),
                ('5', 'B'),
            ]
            .into_iter()
            .collect(),
            digits: [
                ('I', '1'),
                ('|', '1'),
                ('O', '0'),
                ('J', '3'),
                ('G', '6'),
                ('A', '6'),
                ('Z', '7'),
                ('B', '8'),
                ('Y', '9'),
                ('S', '9'),
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl CorrectionTables {
    /// Reject tables whose output could be rewritten by a second pass
    pub fn validate(&self) -> Result<()> {
        for (&from, &to) in &self.letters {
            ensure!(
                !from.is_ascii_uppercase(),
                "letter table rewrites a letter ({from:?})"
            );
            ensure!(
                to.is_ascii_uppercase(),
                "letter table maps {from:?} to non-letter {to:?}"
            );
        }
        for (&from, &to) in &self.digits {
            ensure!(
                !from.is_ascii_digit(),
                "digit table rewrites a digit ({from:?})"
            );
            ensure!(
                to.is_ascii_digit(),
                "digit table maps {from:?} to non-digit {to:?}"
            );
        }
        Ok(())
    }

    /// Apply the tables to an 8-symbol plate string
    ///
    /// Strings of any other length are returned unchanged. Length is counted
    /// in characters, not bytes.
    pub fn correct(&self, text: &str) -> String {
        let mut chars: Vec<char> = text.chars().collect();
        if chars.len() != PLATE_LEN {
            return text.to_string();
        }

        for slot in LETTER_SLOTS {
            if let Some(&fixed) = self.letters.get(&chars[slot]) {
                chars[slot] = fixed;
            }
        }
        for slot in DIGIT_SLOTS {
            if let Some(&fixed) = self.digits.get(&chars[slot]) {
                chars[slot] = fixed;
            }
        }

        chars.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_concatenates_in_order() {
        assert_eq!(assemble(&['A', 'E', '1', '4']), "AE14");
        assert_eq!(assemble(&[]), "");
    }

    #[test]
    fn test_validator_cases() {
        assert!(is_valid("AE1455KH"));
        assert!(!is_valid("AE14 55KH"));
        assert!(!is_valid("A11455KH"));
        assert!(!is_valid("ae1455kh"));
        assert!(!is_valid("AE1455KHX"));
        assert!(!is_valid(""));
        assert!(!is_valid(NOT_RECOGNIZED));
    }

    #[test]
    fn test_validator_rejects_non_ascii_digits() {
        // Arabic-Indic digits
        assert!(!is_valid("AE١٤٥٥KH"));
    }

    #[test]
    fn test_correct_letter_and_digit_slots() {
        let tables = CorrectionTables::default();
        assert_eq!(tables.correct("0E14S5KH"), "OE1495KH");
        assert_eq!(tables.correct("1|OJGA75"), "II0366ZB");
    }

    #[test]
    fn test_correct_leaves_clean_plate_alone() {
        let tables = CorrectionTables::default();
        assert_eq!(tables.correct("AE1455KH"), "AE1455KH");
    }

    #[test]
    fn test_correct_ignores_other_lengths() {
        let tables = CorrectionTables::default();
        assert_eq!(tables.correct("0E14S5K"), "0E14S5K");
        assert_eq!(tables.correct("0E14S5KH0"), "0E14S5KH0");
        assert_eq!(tables.correct(""), "");
    }

    #[test]
    fn test_correct_counts_characters_not_bytes() {
        let tables = CorrectionTables::default();
        // 8 characters, more than 8 bytes
        assert_eq!(tables.correct("0Ё14S5KH"), "OЁ1495KH");
    }

    #[test]
    fn test_correct_is_idempotent() {
        let tables = CorrectionTables::default();
        for raw in ["0E14S5KH", "18OJGAS5", "AE1455KH", "|iZBY7|i", "SHORT"] {
            let once = tables.correct(raw);
            assert_eq!(tables.correct(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn test_tables_toml_roundtrip() {
        let tables = CorrectionTables::default();
        let text = toml::to_string(&tables).unwrap();

        let parsed: CorrectionTables = toml::from_str(&text).unwrap();
        assert_eq!(parsed, tables);
    }

    #[test]
    fn test_tables_reject_multi_symbol_keys() {
        let text = "[letters]\n\"10\" = \"I\"\n";
        assert!(toml::from_str::<CorrectionTables>(text).is_err());
    }

    #[test]
    fn test_tables_parse_partial_override() {
        let text = "[digits]\n\"Q\" = \"0\"\n";
        let parsed: CorrectionTables = toml::from_str(text).unwrap();
        assert_eq!(parsed.digits.get(&'Q'), Some(&'0'));
        assert_eq!(parsed.letters, CorrectionTables::default().letters);
    }

    #[test]
    fn test_default_tables_are_valid() {
        assert!(CorrectionTables::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_chained_tables() {
        let mut tables = CorrectionTables::default();
        tables.letters.insert('O', 'Q');
        assert!(tables.validate().is_err());

        let mut tables = CorrectionTables::default();
        tables.digits.insert('S', 'X');
        assert!(tables.validate().is_err());
    }
}

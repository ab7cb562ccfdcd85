use std::collections::{BTreeMap, HashMap};

use crate::constants::UNCLASSIFIED_LABEL;

/// Result of mapping a raw categorical value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VocabularyMatch {
    /// Value (or one of its aliases) is in the vocabulary
    Known(String),
    /// Value is not in the vocabulary and was mapped to the unclassified label
    Unclassified,
}

impl VocabularyMatch {
    pub fn label(&self) -> &str {
        match self {
            VocabularyMatch::Known(label) => label,
            VocabularyMatch::Unclassified => UNCLASSIFIED_LABEL,
        }
    }
}

/// Canonical vocabulary tables, keyed by vocabulary name. Lookups are case- and
/// whitespace-insensitive; every canonical label also maps to itself.
#[derive(Debug, Clone, Default)]
pub struct Vocabularies {
    tables: BTreeMap<String, HashMap<String, String>>,
}

impl Vocabularies {
    /// Build from `vocabulary name -> (alias -> canonical label)` tables
    pub fn from_tables(tables: &BTreeMap<String, BTreeMap<String, String>>) -> Self {
        let mut compiled = BTreeMap::new();
        for (name, aliases) in tables {
            let mut lookup = HashMap::new();
            for (alias, canonical) in aliases {
                lookup.insert(lookup_key(alias), canonical.clone());
                lookup.insert(lookup_key(canonical), canonical.clone());
            }
            lookup.insert(lookup_key(UNCLASSIFIED_LABEL), UNCLASSIFIED_LABEL.to_string());
            compiled.insert(name.clone(), lookup);
        }
        Self { tables: compiled }
    }

    pub fn contains(&self, vocabulary: &str) -> bool {
        self.tables.contains_key(vocabulary)
    }

    /// Map a raw value through the named vocabulary. Unknown vocabularies classify nothing.
    pub fn classify(&self, vocabulary: &str, raw: &str) -> VocabularyMatch {
        self.tables
            .get(vocabulary)
            .and_then(|table| table.get(&lookup_key(raw)))
            .map(|label| VocabularyMatch::Known(label.clone()))
            .unwrap_or(VocabularyMatch::Unclassified)
    }
}

fn lookup_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

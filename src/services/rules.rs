//! Business-rule collaborator: barcode -> target chute
//!
//! The correlator only asks one question of the rule source: which chute does
//! this barcode go to. `RuleTable` answers it from configuration (exact match,
//! then prefix rules in file order, then an optional default); other sources
//! can plug in through `ChuteRules`.

use rustc_hash::FxHashMap;

/// Resolves a barcode to its destination chute
pub trait ChuteRules: Send + Sync {
    /// `None` when no rule covers the barcode
    fn chute_for(&self, barcode: &str) -> Option<u8>;
}

/// Config-backed rule table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleTable {
    exact: FxHashMap<String, u8>,
    prefix: Vec<(String, u8)>,
    default_chute: Option<u8>,
}

impl RuleTable {
    pub fn new(
        exact: FxHashMap<String, u8>,
        prefix: Vec<(String, u8)>,
        default_chute: Option<u8>,
    ) -> Self {
        Self { exact, prefix, default_chute }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_exact(mut self, barcode: &str, chute: u8) -> Self {
        self.exact.insert(barcode.to_string(), chute);
        self
    }

    pub fn with_prefix(mut self, prefix: &str, chute: u8) -> Self {
        self.prefix.push((prefix.to_string(), chute));
        self
    }

    pub fn with_default(mut self, chute: u8) -> Self {
        self.default_chute = Some(chute);
        self
    }
}

impl ChuteRules for RuleTable {
    fn chute_for(&self, barcode: &str) -> Option<u8> {
        if let Some(&chute) = self.exact.get(barcode) {
            return Some(chute);
        }

        self.prefix
            .iter()
            .find(|(prefix, _)| barcode.starts_with(prefix.as_str()))
            .map(|&(_, chute)| chute)
            .or(self.default_chute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_wins_over_prefix() {
        let rules = RuleTable::default().with_prefix("ABC", 4).with_exact("ABC123", 3);
        assert_eq!(rules.chute_for("ABC123"), Some(3));
        assert_eq!(rules.chute_for("ABC999"), Some(4));
    }

    #[test]
    fn test_prefix_rules_in_order() {
        let rules = RuleTable::default().with_prefix("SF", 10).with_prefix("S", 11);
        assert_eq!(rules.chute_for("SF0001"), Some(10));
        assert_eq!(rules.chute_for("ST0001"), Some(11));
    }

    #[test]
    fn test_default_chute() {
        let rules = RuleTable::default().with_exact("A", 1);
        assert_eq!(rules.chute_for("B"), None);

        let rules = rules.with_default(20);
        assert_eq!(rules.chute_for("B"), Some(20));
        assert_eq!(rules.len(), 1);
    }
}

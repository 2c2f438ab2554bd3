//! Rule definitions (SPEC_FULL §3, §4.1, §6).

use serde::{Deserialize, Serialize};

use super::action::Action;
use super::atom::Atom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    All,
    Any,
}

impl Default for CombineMode {
    fn default() -> Self {
        Self::All
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchBlock {
    #[serde(default)]
    pub combine: CombineMode,
    #[serde(default)]
    pub request: Vec<Atom>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    /// Lower runs first; rules sort by `(priority, name, id)` (SPEC_FULL §4.3).
    #[serde(default)]
    pub priority: i32,
    /// Halts candidate iteration once this rule matches (SPEC_FULL §4.3).
    #[serde(default)]
    pub stop_on_match: bool,
    #[serde(rename = "match")]
    pub match_block: MatchBlock,
    #[serde(default)]
    pub actions: Vec<Action>,

    /// Absolute path of the file this rule was loaded from; used for
    /// hot-reload diagnostics and not serialized back out.
    #[serde(skip)]
    pub source_path: Option<std::path::PathBuf>,
}

impl Rule {
    /// The sort key used for deterministic ordering everywhere a rule set is
    /// iterated (SPEC_FULL §4.3: "priority ascending, then name ascending,
    /// then id ascending").
    pub fn sort_key(&self) -> (i32, &str, &str) {
        (self.priority, self.name.as_str(), self.id.as_str())
    }

    /// Pre-compile every regex/wildcard atom once at load time.
    pub fn compile(&mut self) {
        for atom in &mut self.match_block.request {
            atom.compile();
        }
    }
}

pub fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, name: &str, priority: i32) -> Rule {
        Rule {
            id: id.into(),
            name: name.into(),
            enabled: true,
            priority,
            stop_on_match: false,
            match_block: MatchBlock::default(),
            actions: Vec::new(),
            source_path: None,
        }
    }

    #[test]
    fn sorts_by_priority_then_name_then_id() {
        let mut rules = vec![
            rule("b", "Zeta", 1),
            rule("a", "Alpha", 0),
            rule("c", "Alpha", 0),
        ];
        sort_rules(&mut rules);
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn default_combine_mode_is_all() {
        let block = MatchBlock::default();
        assert_eq!(block.combine, CombineMode::All);
    }
}

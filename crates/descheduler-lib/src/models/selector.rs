//! Label selectors
//!
//! Supports the structured form (`matchLabels` / `matchExpressions`) used by
//! plugin arguments and disruption budgets, and the string form
//! (`app=web,tier!=db,env in (prod,stage),!legacy`) used by the policy's
//! node selector.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from parsing a string label selector
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty selector term in {0:?}")]
    EmptyTerm(String),

    #[error("invalid selector term {0:?}")]
    InvalidTerm(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.map(|v| self.values.contains(v)).unwrap_or(false),
            SelectorOperator::NotIn => value.map(|v| !self.values.contains(v)).unwrap_or(true),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// A label selector; the empty selector matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|e| e.matches(labels))
    }

    /// Parse the comma-separated string form of a selector
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        let mut selector = LabelSelector::default();
        if raw.trim().is_empty() {
            return Ok(selector);
        }

        for term in split_terms(raw) {
            let term = term.trim();
            if term.is_empty() {
                return Err(SelectorError::EmptyTerm(raw.to_string()));
            }
            parse_term(term, &mut selector)?;
        }

        Ok(selector)
    }
}

/// Split on commas that are not inside a parenthesized value set
fn split_terms(raw: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in raw.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&raw[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    terms.push(&raw[start..]);
    terms
}

fn parse_term(term: &str, selector: &mut LabelSelector) -> Result<(), SelectorError> {
    let invalid = || SelectorError::InvalidTerm(term.to_string());

    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() {
            return Err(invalid());
        }
        selector.match_expressions.push(LabelSelectorRequirement {
            key: key.to_string(),
            operator: SelectorOperator::DoesNotExist,
            values: Vec::new(),
        });
        return Ok(());
    }

    if let Some((key, value)) = term.split_once("!=") {
        selector.match_expressions.push(LabelSelectorRequirement {
            key: non_empty(key).ok_or_else(invalid)?,
            operator: SelectorOperator::NotIn,
            values: vec![value.trim().to_string()],
        });
        return Ok(());
    }

    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        selector
            .match_labels
            .insert(non_empty(key).ok_or_else(invalid)?, value.trim().to_string());
        return Ok(());
    }

    for (keyword, operator) in [(" notin ", SelectorOperator::NotIn), (" in ", SelectorOperator::In)] {
        if let Some((key, set)) = term.split_once(keyword) {
            let set = set.trim();
            let inner = set
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(invalid)?;
            let values = inner
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            selector.match_expressions.push(LabelSelectorRequirement {
                key: non_empty(key).ok_or_else(invalid)?,
                operator,
                values,
            });
            return Ok(());
        }
    }

    if term.chars().any(|c| c.is_whitespace() || c == '(' || c == ')') {
        return Err(invalid());
    }

    selector.match_expressions.push(LabelSelectorRequirement {
        key: term.to_string(),
        operator: SelectorOperator::Exists,
        values: Vec::new(),
    });
    Ok(())
}

fn non_empty(key: &str) -> Option<String> {
    let key = key.trim();
    (!key.is_empty()).then(|| key.to_string())
}

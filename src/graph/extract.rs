//! Static reference extraction
//!
//! Dependencies are determined from expression text without evaluating it:
//! `%name` environment references and `linkId = 'X'` answer selections are
//! the only two ways an SDC expression reads another value.

use once_cell::sync::Lazy;
use regex::Regex;

/// Names an expression reads, in order of first appearance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedRefs {
    /// `%name` and `` %`quoted name` `` references
    pub variables: Vec<String>,
    /// linkIds selected via `item.where(linkId = '...')` chains
    pub answers: Vec<String>,
}

static VARIABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%(?:`([^`]+)`|([A-Za-z_][A-Za-z0-9_]*))").expect("variable regex"));

static LINK_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"linkId\s*=\s*'([^']+)'").expect("linkId regex"));

/// Extract every name a fhirpath expression reads
pub fn extract_refs(expression: &str) -> ExtractedRefs {
    let mut refs = ExtractedRefs::default();

    for captures in VARIABLE_RE.captures_iter(expression) {
        let name = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str().to_string());
        if let Some(name) = name {
            if !refs.variables.contains(&name) {
                refs.variables.push(name);
            }
        }
    }

    for captures in LINK_ID_RE.captures_iter(expression) {
        if let Some(link_id) = captures.get(1) {
            let link_id = link_id.as_str().to_string();
            if !refs.answers.contains(&link_id) {
                refs.answers.push(link_id);
            }
        }
    }

    refs
}

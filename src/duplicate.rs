use crate::model::SheetResult;
use std::collections::HashMap;

/// Groups sheet results by combined identity, keeping only identities that
/// appear on two or more sheets. Results without a combined id never group.
pub fn detect_duplicates(results: &[SheetResult]) -> HashMap<String, Vec<SheetResult>> {
    let mut groups: HashMap<String, Vec<SheetResult>> = HashMap::new();
    for result in results {
        if let Some(combined_id) = result.combined_id() {
            groups.entry(combined_id).or_default().push(result.clone());
        }
    }
    groups.retain(|_, members| members.len() >= 2);
    groups
}

/// Flags every result whose combined id is a duplicate group key and appends
/// the group size to its error text.
///
/// Must run exactly once per freshly analyzed result set: re-applying to
/// already-flagged results appends a second `duplicate (N)` message. Callers
/// regenerate sheets through the analyzer before re-running detection.
pub fn apply_duplicates(results: &mut [SheetResult], groups: &HashMap<String, Vec<SheetResult>>) {
    for result in results.iter_mut() {
        let Some(combined_id) = result.combined_id() else {
            continue;
        };
        if let Some(members) = groups.get(&combined_id) {
            result.is_duplicate = true;
            result.push_error(format!("duplicate ({})", members.len()));
        }
    }
}

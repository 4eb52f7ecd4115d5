use crate::model::{
    BarcodeResult, Document, MarkingResult, Session, SheetResult, DEFAULT_OPTIONS,
    DEFAULT_QUESTIONS,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Identity fields read out of a sheet's barcode decodes, plus any decode
/// problems worth surfacing on the sheet.
#[derive(Debug, Clone, Default)]
pub struct BarcodeIdentity {
    pub student_id: Option<String>,
    pub interview_id: Option<String>,
    pub errors: Vec<String>,
}

/// Maps barcode areas to identity fields so the slot layout is not baked
/// into the analyzer. Swap this out for templates that order their barcode
/// areas differently.
pub trait BarcodeSemantics: Send + Sync {
    fn read(&self, barcodes: &[BarcodeResult]) -> BarcodeIdentity;
}

/// Positional mapping: one slot carries the student id, another the
/// interview id.
#[derive(Debug, Clone, Copy)]
pub struct SlotSemantics {
    pub student_slot: usize,
    pub interview_slot: usize,
}

impl Default for SlotSemantics {
    fn default() -> Self {
        Self {
            student_slot: 0,
            interview_slot: 1,
        }
    }
}

impl SlotSemantics {
    fn slot_text(
        &self,
        barcodes: &[BarcodeResult],
        slot: usize,
        label: &str,
        errors: &mut Vec<String>,
    ) -> Option<String> {
        match barcodes.get(slot) {
            None => {
                errors.push(format!("{} barcode missing", label));
                None
            }
            Some(b) if !b.success => {
                errors.push(format!("{} barcode decode failed", label));
                None
            }
            Some(b) => match b.decoded_text.as_deref().map(str::trim) {
                Some(text) if !text.is_empty() => Some(text.to_string()),
                _ => {
                    errors.push(format!("{} barcode empty", label));
                    None
                }
            },
        }
    }
}

impl BarcodeSemantics for SlotSemantics {
    fn read(&self, barcodes: &[BarcodeResult]) -> BarcodeIdentity {
        let mut identity = BarcodeIdentity::default();
        identity.student_id =
            self.slot_text(barcodes, self.student_slot, "student id", &mut identity.errors);
        identity.interview_id = self.slot_text(
            barcodes,
            self.interview_slot,
            "interview id",
            &mut identity.errors,
        );
        identity
    }
}

/// Combines one image's marking and barcode detections into a
/// [`SheetResult`]. Pure and uncached; safe to re-invoke at
/// O(questions x options) per sheet.
#[derive(Clone)]
pub struct SheetAnalyzer {
    questions: usize,
    options_per_question: u8,
    semantics: Arc<dyn BarcodeSemantics>,
}

impl SheetAnalyzer {
    pub fn new(
        questions: usize,
        options_per_question: u8,
        semantics: Arc<dyn BarcodeSemantics>,
    ) -> Self {
        Self {
            questions,
            options_per_question,
            semantics,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_QUESTIONS,
            DEFAULT_OPTIONS,
            Arc::new(SlotSemantics::default()),
        )
    }

    pub fn questions(&self) -> usize {
        self.questions
    }

    pub fn identity(&self, barcodes: &[BarcodeResult]) -> BarcodeIdentity {
        self.semantics.read(barcodes)
    }

    pub fn analyze_sheet(
        &self,
        document: &Document,
        markings: Option<&[MarkingResult]>,
        barcodes: Option<&[BarcodeResult]>,
    ) -> SheetResult {
        let mut result = SheetResult::new(document.image_id.clone(), self.questions);

        if let Some(barcodes) = barcodes {
            let identity = self.semantics.read(barcodes);
            result.student_id = identity.student_id;
            result.interview_id = identity.interview_id;
            for error in identity.errors {
                result.push_error(error);
            }
        }

        if let Some(markings) = markings {
            let expected = self.questions * self.options_per_question as usize;
            if markings.len() < expected {
                result.push_error(format!(
                    "insufficient marking count: expected {} got {}",
                    expected,
                    markings.len()
                ));
            } else {
                for question in 1..=self.questions as u32 {
                    self.resolve_question(question, markings, &mut result);
                }
            }
        }

        if result.combined_id().is_none() {
            result.push_error("missing combined id");
        }
        result
    }

    /// Reduces one question's option cells to a single marked option, or an
    /// error when the cells do not say exactly one thing.
    fn resolve_question(&self, question: u32, markings: &[MarkingResult], result: &mut SheetResult) {
        let mut entries: Vec<&MarkingResult> = markings
            .iter()
            .filter(|m| m.question_number == question)
            .collect();
        entries.sort_by_key(|m| m.option_number);

        if entries.is_empty() {
            result.push_error(format!("no result for question {}", question));
            return;
        }

        let marked: Vec<u8> = entries
            .iter()
            .filter(|m| m.is_marked)
            .map(|m| m.option_number)
            .collect();
        match marked.as_slice() {
            [] => result.push_error(format!("question {} unmarked", question)),
            [option] => result.markings[(question - 1) as usize] = Some(*option),
            many => {
                let listed: Vec<String> = many.iter().map(u8::to_string).collect();
                result.push_error(format!(
                    "question {} has multiple marks: {}",
                    question,
                    listed.join(", ")
                ));
            }
        }
    }

    /// Analyzes every document in the session. Documents without detection
    /// maps come out with absent identity/markings, not extra errors.
    pub fn analyze_all(&self, session: &Session) -> Vec<SheetResult> {
        session
            .documents
            .iter()
            .map(|doc| {
                self.analyze_sheet(
                    doc,
                    session.markings_for(&doc.image_id),
                    session.barcodes_for(&doc.image_id),
                )
            })
            .collect()
    }

    /// Analyzes only the documents named in `image_ids`; the cache's
    /// per-student path uses this to avoid a full-session pass.
    pub fn analyze_images(&self, session: &Session, image_ids: &HashSet<String>) -> Vec<SheetResult> {
        session
            .documents
            .iter()
            .filter(|doc| image_ids.contains(&doc.image_id))
            .map(|doc| {
                self.analyze_sheet(
                    doc,
                    session.markings_for(&doc.image_id),
                    session.barcodes_for(&doc.image_id),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(image_id: &str) -> Document {
        Document {
            image_id: image_id.to_string(),
            source_path: format!("scans/{}.png", image_id),
            alignment: None,
        }
    }

    fn barcode(area: &str, text: Option<&str>) -> BarcodeResult {
        BarcodeResult {
            barcode_area_id: area.to_string(),
            success: text.is_some(),
            decoded_text: text.map(str::to_string),
        }
    }

    /// Full marking grid for a 2-question, 3-option sheet with the given
    /// options marked.
    fn grid(marked: &[(u32, u8)]) -> Vec<MarkingResult> {
        let mut out = Vec::new();
        for question in 1..=2u32 {
            for option in 1..=3u8 {
                out.push(MarkingResult {
                    scoring_area_id: format!("q{}o{}", question, option),
                    question_number: question,
                    option_number: option,
                    is_marked: marked.contains(&(question, option)),
                });
            }
        }
        out
    }

    fn analyzer() -> SheetAnalyzer {
        SheetAnalyzer::new(2, 3, Arc::new(SlotSemantics::default()))
    }

    #[test]
    fn clean_sheet_has_no_errors() {
        let barcodes = vec![barcode("b0", Some("1001")), barcode("b1", Some("7"))];
        let markings = grid(&[(1, 2), (2, 3)]);
        let result = analyzer().analyze_sheet(&doc("img-1"), Some(&markings), Some(&barcodes));

        assert!(!result.has_errors, "{:?}", result.error_message);
        assert_eq!(result.combined_id().as_deref(), Some("1001_7"));
        assert_eq!(result.markings, vec![Some(2), Some(3)]);
    }

    #[test]
    fn unmarked_and_multi_marked_questions_yield_absent_markings() {
        let barcodes = vec![barcode("b0", Some("1001")), barcode("b1", Some("7"))];
        let markings = grid(&[(2, 1), (2, 3)]);
        let result = analyzer().analyze_sheet(&doc("img-1"), Some(&markings), Some(&barcodes));

        assert_eq!(result.markings, vec![None, None]);
        let message = result.error_message.expect("errors recorded");
        assert!(message.contains("question 1 unmarked"), "{}", message);
        assert!(message.contains("question 2 has multiple marks: 1, 3"), "{}", message);
    }

    #[test]
    fn short_marking_list_reports_count_only() {
        let barcodes = vec![barcode("b0", Some("1001")), barcode("b1", Some("7"))];
        let markings = grid(&[(1, 1)])[..4].to_vec();
        let result = analyzer().analyze_sheet(&doc("img-1"), Some(&markings), Some(&barcodes));

        assert_eq!(
            result.error_message.as_deref(),
            Some("insufficient marking count: expected 6 got 4")
        );
        assert_eq!(result.markings, vec![None, None]);
    }

    #[test]
    fn failed_barcode_keeps_other_slot_and_reports_missing_combined_id() {
        let barcodes = vec![barcode("b0", Some("1001")), barcode("b1", None)];
        let result = analyzer().analyze_sheet(&doc("img-1"), None, Some(&barcodes));

        assert_eq!(result.student_id.as_deref(), Some("1001"));
        assert_eq!(result.interview_id, None);
        let message = result.error_message.expect("errors recorded");
        assert!(message.contains("interview id barcode decode failed"), "{}", message);
        assert!(message.contains("missing combined id"), "{}", message);
    }

    #[test]
    fn unanalyzed_document_gets_only_missing_combined_id() {
        let result = analyzer().analyze_sheet(&doc("img-1"), None, None);
        assert_eq!(result.error_message.as_deref(), Some("missing combined id"));
    }

    #[test]
    fn analyze_all_covers_every_document() {
        let mut session = Session::new("round-a");
        session.documents.push(doc("img-1"));
        session.documents.push(doc("img-2"));
        session
            .barcodes
            .insert("img-1".to_string(), vec![barcode("b0", Some("1001")), barcode("b1", Some("7"))]);
        session.markings.insert("img-1".to_string(), grid(&[(1, 1), (2, 2)]));

        let results = analyzer().analyze_all(&session);
        assert_eq!(results.len(), 2);
        assert!(!results[0].has_errors);
        assert!(results[1].has_errors);
    }

    #[test]
    fn swapped_slot_semantics_change_identity_mapping() {
        let semantics = SlotSemantics {
            student_slot: 1,
            interview_slot: 0,
        };
        let analyzer = SheetAnalyzer::new(2, 3, Arc::new(semantics));
        let barcodes = vec![barcode("b0", Some("7")), barcode("b1", Some("1001"))];
        let result = analyzer.analyze_sheet(&doc("img-1"), None, Some(&barcodes));

        assert_eq!(result.student_id.as_deref(), Some("1001"));
        assert_eq!(result.interview_id.as_deref(), Some("7"));
    }
}

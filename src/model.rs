use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Interview sheets carry a small fixed schema: four questions with five
/// score options each unless a template overrides it.
pub const DEFAULT_QUESTIONS: usize = 4;
pub const DEFAULT_OPTIONS: u8 = 5;

/// Summary lists are pre-truncated to this many entries for display.
pub const SUMMARY_PREVIEW_LEN: usize = 20;

/// Output of the external timing-mark aligner for one scanned image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentResult {
    pub success: bool,
    pub confidence: f64,
    /// Row-major 2x3 affine transform from template space to image space.
    pub transform: [f64; 6],
}

/// One option cell's mark/no-mark verdict from the external pixel detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkingResult {
    pub scoring_area_id: String,
    pub question_number: u32,
    pub option_number: u8,
    pub is_marked: bool,
}

/// One barcode area's decode attempt. `decoded_text` is present only on a
/// successful decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarcodeResult {
    pub barcode_area_id: String,
    pub success: bool,
    pub decoded_text: Option<String>,
}

/// One scanned image registered in a round's session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub image_id: String,
    pub source_path: String,
    pub alignment: Option<AlignmentResult>,
}

impl Document {
    pub fn new(source_path: impl Into<String>) -> Self {
        Self {
            image_id: Uuid::new_v4().to_string(),
            source_path: source_path.into(),
            alignment: None,
        }
    }
}

/// A round's working set: its documents plus the per-image detection maps.
/// A document missing from `markings`/`barcodes` has simply not been
/// analyzed yet; that is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub round: String,
    pub documents: Vec<Document>,
    #[serde(default)]
    pub markings: HashMap<String, Vec<MarkingResult>>,
    #[serde(default)]
    pub barcodes: HashMap<String, Vec<BarcodeResult>>,
}

impl Session {
    pub fn new(round: impl Into<String>) -> Self {
        Self {
            round: round.into(),
            documents: Vec::new(),
            markings: HashMap::new(),
            barcodes: HashMap::new(),
        }
    }

    pub fn markings_for(&self, image_id: &str) -> Option<&[MarkingResult]> {
        self.markings.get(image_id).map(Vec::as_slice)
    }

    pub fn barcodes_for(&self, image_id: &str) -> Option<&[BarcodeResult]> {
        self.barcodes.get(image_id).map(Vec::as_slice)
    }
}

/// Per-question, per-option score table. `scores[q - 1][opt - 1]` is the
/// value awarded when question `q` is marked with option `opt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringRule {
    pub scores: Vec<Vec<f64>>,
}

impl ScoringRule {
    pub fn from_table(scores: Vec<Vec<f64>>) -> Self {
        Self { scores }
    }

    /// Rule where option `n` is worth `n` points on every question.
    pub fn linear(questions: usize, options: u8) -> Self {
        let row: Vec<f64> = (1..=options).map(f64::from).collect();
        Self {
            scores: vec![row; questions],
        }
    }

    /// Unknown question/option pairs score zero rather than failing; the
    /// analyzer already reports malformed markings as sheet errors.
    pub fn score(&self, question: u32, option: u8) -> f64 {
        self.scores
            .get(question.saturating_sub(1) as usize)
            .and_then(|row| row.get(option.saturating_sub(1) as usize))
            .copied()
            .unwrap_or(0.0)
    }
}

/// One row of the externally imported student registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStudent {
    pub student_id: String,
    pub name: String,
    pub registration_number: String,
    pub exam_type: String,
    pub school: String,
    pub birth_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRegistry {
    pub students: Vec<RegistryStudent>,
}

impl StudentRegistry {
    pub fn find(&self, student_id: &str) -> Option<&RegistryStudent> {
        self.students.iter().find(|s| s.student_id == student_id)
    }

    pub fn student_ids(&self) -> impl Iterator<Item = &str> {
        self.students.iter().map(|s| s.student_id.as_str())
    }
}

/// Analysis outcome for one scanned sheet. Derived from the session's raw
/// detections and regenerated whenever those change; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetResult {
    pub image_id: String,
    pub student_id: Option<String>,
    pub interview_id: Option<String>,
    /// Flat per-question array; index `q - 1` holds the single marked
    /// option for question `q`, or `None` for unmarked/multi-marked.
    pub markings: Vec<Option<u8>>,
    pub has_errors: bool,
    pub error_message: Option<String>,
    /// Set only by duplicate detection, never by the analyzer.
    pub is_duplicate: bool,
}

impl SheetResult {
    pub fn new(image_id: impl Into<String>, questions: usize) -> Self {
        Self {
            image_id: image_id.into(),
            student_id: None,
            interview_id: None,
            markings: vec![None; questions],
            has_errors: false,
            error_message: None,
            is_duplicate: false,
        }
    }

    /// The duplicate-detection key: present only when both barcode slots
    /// decoded.
    pub fn combined_id(&self) -> Option<String> {
        match (self.student_id.as_deref(), self.interview_id.as_deref()) {
            (Some(s), Some(i)) => Some(format!("{}_{}", s, i)),
            _ => None,
        }
    }

    /// Errors are additive display text, semicolon-joined; analysis never
    /// drops a sheet over them.
    pub fn push_error(&mut self, message: impl AsRef<str>) {
        self.has_errors = true;
        let message = message.as_ref();
        self.error_message = Some(match self.error_message.take() {
            Some(existing) => format!("{}; {}", existing, message),
            None => message.to_string(),
        });
    }
}

/// Aggregated grade for one student across all their interview sheets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGrade {
    pub student_id: String,
    pub name: String,
    pub registration_number: String,
    pub exam_type: String,
    pub school: String,
    pub birth_date: Option<NaiveDate>,
    /// Mean scored value per question over the sheets that marked it.
    pub question_averages: Vec<Option<f64>>,
    /// Sum of the raw per-question score sums, before averaging. Ranking
    /// key only; not shown to users.
    pub total_score_raw: Option<f64>,
    /// Sum of the per-question averages; the user-facing total.
    pub total_score: Option<f64>,
    pub average_score: Option<f64>,
    /// Competition rank within this student's exam-type partition.
    pub rank: Option<u32>,
    pub interviewer_count: usize,
    pub is_duplicate: bool,
    pub duplicate_count: usize,
    pub is_simple_error: bool,
    pub detail: Option<String>,
}

impl StudentGrade {
    pub fn new(student_id: impl Into<String>, questions: usize) -> Self {
        Self {
            student_id: student_id.into(),
            name: String::new(),
            registration_number: String::new(),
            exam_type: String::new(),
            school: String::new(),
            birth_date: None,
            question_averages: vec![None; questions],
            total_score_raw: None,
            total_score: None,
            average_score: None,
            rank: None,
            interviewer_count: 0,
            is_duplicate: false,
            duplicate_count: 0,
            is_simple_error: false,
            detail: None,
        }
    }

    pub fn push_detail(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.detail = Some(match self.detail.take() {
            Some(existing) => format!("{}; {}", existing, message),
            None => message.to_string(),
        });
    }
}

/// Display list capped at [`SUMMARY_PREVIEW_LEN`] entries; the full count
/// survives in `count` and the preview ends with an "N more" marker when
/// truncated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncatedList {
    pub count: usize,
    pub preview: Vec<String>,
}

impl TruncatedList {
    pub fn new(items: Vec<String>) -> Self {
        let count = items.len();
        let mut preview: Vec<String> = items.into_iter().take(SUMMARY_PREVIEW_LEN).collect();
        if count > SUMMARY_PREVIEW_LEN {
            preview.push(format!("{} more", count - SUMMARY_PREVIEW_LEN));
        }
        Self { count, preview }
    }
}

/// Round-wide verification summary, computed once per cache epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSummary {
    pub round: String,
    pub sheet_count: usize,
    pub student_count: usize,
    pub error_sheets: TruncatedList,
    pub duplicate_students: TruncatedList,
    pub null_combined_id: TruncatedList,
    /// Graded students with no registry row.
    pub unregistered_students: TruncatedList,
    /// Registry rows with no graded sheets.
    pub ungraded_students: TruncatedList,
}

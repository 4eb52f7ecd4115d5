//! Analysis and grading core for scanned interview score sheets.
//!
//! Raw per-sheet detections (alignment confidence, per-option mark flags,
//! decoded barcodes) come from external scanning collaborators; this crate
//! combines them into deduplicated [`SheetResult`]s and aggregates those
//! into ranked per-student [`StudentGrade`]s with a round-wide
//! [`RoundSummary`]. All caching is scoped to the active round key and
//! invalidated atomically when the key changes.

pub mod analyze;
pub mod cache;
pub mod duplicate;
pub mod grading;
pub mod model;
pub mod store;

pub use analyze::{BarcodeIdentity, BarcodeSemantics, SheetAnalyzer, SlotSemantics};
pub use cache::{AnalysisCache, CacheError, Slot};
pub use duplicate::{apply_duplicates, detect_duplicates};
pub use grading::{
    build_summary, compute_for_student, rank, GradedRound, GradingAggregator,
    SIMPLE_ERROR_MAX_INTERVIEWERS,
};
pub use model::{
    AlignmentResult, BarcodeResult, Document, MarkingResult, RegistryStudent, RoundSummary,
    ScoringRule, Session, SheetResult, StudentGrade, StudentRegistry, TruncatedList,
    DEFAULT_OPTIONS, DEFAULT_QUESTIONS, SUMMARY_PREVIEW_LEN,
};
pub use store::{DirRoundStore, MemoryRoundStore, RoundStore, StoreError};

use markscan::{
    AnalysisCache, BarcodeResult, GradingAggregator, MarkingResult, MemoryRoundStore,
    RegistryStudent, ScoringRule, Session, SheetAnalyzer, SlotSemantics, StudentRegistry,
};
use std::collections::HashMap;
use std::sync::Arc;

const QUESTIONS: usize = 2;
const OPTIONS: u8 = 5;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn barcode(area: &str, text: Option<&str>) -> BarcodeResult {
    BarcodeResult {
        barcode_area_id: area.to_string(),
        success: text.is_some(),
        decoded_text: text.map(str::to_string),
    }
}

/// Full grid marking exactly `chosen[q - 1]` on each question.
fn grid(chosen: &[u8]) -> Vec<MarkingResult> {
    let mut out = Vec::new();
    for question in 1..=QUESTIONS as u32 {
        for option in 1..=OPTIONS {
            out.push(MarkingResult {
                scoring_area_id: format!("q{}o{}", question, option),
                question_number: question,
                option_number: option,
                is_marked: chosen[(question - 1) as usize] == option,
            });
        }
    }
    out
}

fn add_sheet(
    session: &mut Session,
    image_id: &str,
    student: Option<&str>,
    interview: Option<&str>,
    chosen: &[u8],
) {
    session.documents.push(markscan::Document {
        image_id: image_id.to_string(),
        source_path: format!("scans/{}.png", image_id),
        alignment: None,
    });
    session.barcodes.insert(
        image_id.to_string(),
        vec![barcode("b0", student), barcode("b1", interview)],
    );
    session.markings.insert(image_id.to_string(), grid(chosen));
}

fn registry(rows: &[(&str, &str)]) -> StudentRegistry {
    StudentRegistry {
        students: rows
            .iter()
            .map(|(id, exam_type)| RegistryStudent {
                student_id: id.to_string(),
                name: format!("Student {}", id),
                registration_number: format!("R-{}", id),
                exam_type: exam_type.to_string(),
                school: "Central".to_string(),
                birth_date: None,
            })
            .collect(),
    }
}

fn aggregator_for(round: &str, session: Session, registry: StudentRegistry) -> GradingAggregator {
    init_tracing();
    let mut store = MemoryRoundStore::new();
    store.insert_round(round, session, ScoringRule::linear(QUESTIONS, OPTIONS), registry);
    let analyzer = SheetAnalyzer::new(QUESTIONS, OPTIONS, Arc::new(SlotSemantics::default()));
    GradingAggregator::new(Arc::new(AnalysisCache::new(Arc::new(store), analyzer)))
}

#[tokio::test]
async fn duplicate_combined_identity_flows_into_the_grade() {
    let mut session = Session::new("round-a");
    add_sheet(&mut session, "img-1", Some("1001"), Some("7"), &[3, 3]);
    add_sheet(&mut session, "img-2", Some("1001"), Some("7"), &[4, 4]);
    add_sheet(&mut session, "img-3", Some("1001"), Some("8"), &[5, 5]);
    let aggregator = aggregator_for("round-a", session, registry(&[("1001", "regular")]));

    let graded = aggregator.all_grades("round-a").await.expect("grade round");
    let grade = graded.grade("1001").expect("grade for 1001");
    assert!(grade.is_duplicate);
    assert_eq!(grade.duplicate_count, 2);
    assert_eq!(grade.interviewer_count, 3);

    // Both duplicate sheets carry the group size in their error text.
    let summary = graded.summary();
    assert_eq!(summary.duplicate_students.preview, vec!["1001".to_string()]);
    assert_eq!(summary.error_sheets.count, 2);
    for line in &summary.error_sheets.preview {
        assert!(line.contains("duplicate (2)"), "{}", line);
    }
}

#[tokio::test]
async fn registry_row_without_sheets_is_reported_missing_in_grading() {
    let mut session = Session::new("round-a");
    add_sheet(&mut session, "img-1", Some("1001"), Some("7"), &[3, 3]);
    let aggregator = aggregator_for(
        "round-a",
        session,
        registry(&[("1001", "regular"), ("2002", "regular")]),
    );

    let graded = aggregator.all_grades("round-a").await.expect("grade round");
    let summary = graded.summary();
    assert_eq!(summary.ungraded_students.count, 1);
    assert_eq!(summary.ungraded_students.preview, vec!["2002".to_string()]);
    assert_eq!(summary.unregistered_students.count, 0);
}

#[tokio::test]
async fn failed_interview_barcode_still_contributes_to_the_student() {
    let mut session = Session::new("round-a");
    add_sheet(&mut session, "img-1", Some("1001"), Some("7"), &[3, 3]);
    // Second barcode failed: no combined id, but grouping keys on the
    // student id alone.
    add_sheet(&mut session, "img-2", Some("1001"), None, &[5, 5]);
    let aggregator = aggregator_for("round-a", session, registry(&[("1001", "regular")]));

    let graded = aggregator.all_grades("round-a").await.expect("grade round");
    let grade = graded.grade("1001").expect("grade for 1001");
    assert_eq!(grade.interviewer_count, 2);
    assert_eq!(grade.question_averages, vec![Some(4.0), Some(4.0)]);

    let summary = graded.summary();
    assert_eq!(summary.null_combined_id.count, 1);
    assert_eq!(summary.null_combined_id.preview, vec!["1001".to_string()]);
}

#[tokio::test]
async fn equal_raw_totals_share_a_competition_rank() {
    let mut session = Session::new("round-a");
    add_sheet(&mut session, "img-1", Some("1001"), Some("7"), &[5, 5]);
    add_sheet(&mut session, "img-2", Some("1002"), Some("7"), &[5, 5]);
    add_sheet(&mut session, "img-3", Some("1003"), Some("7"), &[5, 3]);
    let aggregator = aggregator_for(
        "round-a",
        session,
        registry(&[("1001", "regular"), ("1002", "regular"), ("1003", "regular")]),
    );

    let graded = aggregator.all_grades("round-a").await.expect("grade round");
    let ranks: HashMap<&str, Option<u32>> = graded
        .grades()
        .iter()
        .map(|g| (g.student_id.as_str(), g.rank))
        .collect();
    assert_eq!(ranks["1001"], Some(1));
    assert_eq!(ranks["1002"], Some(1));
    assert_eq!(ranks["1003"], Some(3));
}

#[tokio::test]
async fn single_student_query_skips_the_full_round() {
    let mut session = Session::new("round-a");
    add_sheet(&mut session, "img-1", Some("1001"), Some("7"), &[4, 2]);
    add_sheet(&mut session, "img-2", Some("1002"), Some("7"), &[1, 1]);
    let aggregator = aggregator_for(
        "round-a",
        session,
        registry(&[("1001", "regular"), ("1002", "regular")]),
    );

    let grade = aggregator
        .grade_for("round-a", "1001")
        .await
        .expect("query grade")
        .expect("1001 has sheets");
    assert_eq!(grade.question_averages, vec![Some(4.0), Some(2.0)]);
    assert_eq!(grade.total_score, Some(6.0));
    // The subset path cannot see the whole partition.
    assert_eq!(grade.rank, None);

    // Unknown and blank ids are empty queries, not errors.
    assert!(aggregator
        .grade_for("round-a", "9999")
        .await
        .expect("query grade")
        .is_none());
    assert!(aggregator
        .grade_for("round-a", "  ")
        .await
        .expect("query grade")
        .is_none());
}

#[tokio::test]
async fn grades_for_returns_only_students_with_sheets() {
    let mut session = Session::new("round-a");
    add_sheet(&mut session, "img-1", Some("1001"), Some("7"), &[4, 2]);
    let aggregator = aggregator_for("round-a", session, registry(&[("1001", "regular")]));

    let grades = aggregator
        .grades_for(
            "round-a",
            &["1001".to_string(), "9999".to_string(), String::new()],
        )
        .await
        .expect("query grades");
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0].student_id, "1001");
}

#[tokio::test]
async fn unregistered_graded_student_is_forced_into_simple_error() {
    let mut session = Session::new("round-a");
    add_sheet(&mut session, "img-1", Some("1001"), Some("7"), &[5, 5]);
    add_sheet(&mut session, "img-2", Some("1001"), Some("8"), &[5, 5]);
    add_sheet(&mut session, "img-3", Some("1001"), Some("9"), &[5, 5]);
    let aggregator = aggregator_for("round-a", session, registry(&[]));

    let graded = aggregator.all_grades("round-a").await.expect("grade round");
    let grade = graded.grade("1001").expect("grade for 1001");
    // Three interviewers, so not a simple error on its own; the registry
    // mismatch forces the flag.
    assert_eq!(grade.interviewer_count, 3);
    assert!(grade.is_simple_error);
    assert_eq!(grade.detail.as_deref(), Some("not in registry"));
    assert_eq!(
        graded.summary().unregistered_students.preview,
        vec!["1001".to_string()]
    );
}

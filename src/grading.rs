use crate::cache::{AnalysisCache, CacheError, Slot};
use crate::model::{
    RoundSummary, ScoringRule, SheetResult, StudentGrade, StudentRegistry, TruncatedList,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task;
use tracing::{debug, info};

/// Students with this many interviewer sheets or fewer are flagged as
/// simple errors. Fixed business rule.
pub const SIMPLE_ERROR_MAX_INTERVIEWERS: usize = 2;

/// One epoch's grading output: grades, their id index and the round summary
/// are computed together and only ever replaced together.
#[derive(Clone)]
pub struct GradedRound {
    grades: Arc<Vec<StudentGrade>>,
    index: Arc<HashMap<String, usize>>,
    summary: Arc<RoundSummary>,
}

impl GradedRound {
    pub fn grades(&self) -> &[StudentGrade] {
        &self.grades
    }

    pub fn summary(&self) -> &RoundSummary {
        &self.summary
    }

    pub fn grade(&self, student_id: &str) -> Option<&StudentGrade> {
        self.index.get(student_id).map(|&i| &self.grades[i])
    }
}

#[derive(Default)]
struct GradeState {
    round: Option<String>,
    full: Slot<GradedRound>,
    /// Opportunistic single-student memos from the subset path; superseded
    /// by `full` once the whole round is graded.
    by_student: HashMap<String, StudentGrade>,
}

/// Aggregates cached sheet results into per-student grades, rankings and a
/// round summary. Same round-scoped discipline as [`AnalysisCache`], one
/// level up and behind its own gate.
pub struct GradingAggregator {
    cache: Arc<AnalysisCache>,
    state: Mutex<GradeState>,
}

impl GradingAggregator {
    pub fn new(cache: Arc<AnalysisCache>) -> Self {
        Self {
            cache,
            state: Mutex::new(GradeState::default()),
        }
    }

    async fn state_for(&self, round: &str) -> MutexGuard<'_, GradeState> {
        let mut state = self.state.lock().await;
        if state.round.as_deref() != Some(round) {
            if let Some(previous) = state.round.as_deref() {
                debug!(from = previous, to = round, "round switch, grade cache cleared");
            }
            *state = GradeState {
                round: Some(round.to_string()),
                ..GradeState::default()
            };
        }
        state
    }

    /// Grades the whole round once per epoch: full sheet results, registry
    /// and scoring rule come from the analysis cache, aggregation runs on
    /// the blocking pool.
    pub async fn all_grades(&self, round: &str) -> Result<GradedRound, CacheError> {
        let mut state = self.state_for(round).await;
        if let Some(graded) = state.full.get() {
            return Ok(graded);
        }
        let sheets = self.cache.all_sheet_results(round).await?;
        let registry = self.cache.registry(round).await?;
        let rule = self.cache.scoring_rule(round).await?;
        let questions = self.cache.analyzer().questions();

        let round_key = round.to_string();
        let graded = task::spawn_blocking(move || {
            compute_round(&round_key, &sheets, &registry, &rule, questions)
        })
        .await?;
        info!(round, students = graded.grades.len(), "round grading complete");
        state.full = Slot::Loaded(graded.clone());
        Ok(graded)
    }

    /// Grade for one student. Served from the epoch's full index when
    /// available; otherwise computed through the analysis cache's subset
    /// path and memoized without forcing a full-round computation. A blank
    /// id is an empty query, not an error.
    pub async fn grade_for(
        &self,
        round: &str,
        student_id: &str,
    ) -> Result<Option<StudentGrade>, CacheError> {
        if student_id.trim().is_empty() {
            return Ok(None);
        }
        let mut state = self.state_for(round).await;
        if let Some(graded) = state.full.get() {
            return Ok(graded.grade(student_id).cloned());
        }
        if let Some(grade) = state.by_student.get(student_id) {
            return Ok(Some(grade.clone()));
        }

        let sheets = self
            .cache
            .sheet_results_for_student(round, student_id)
            .await?;
        if sheets.is_empty() {
            return Ok(None);
        }
        let registry = self.cache.registry(round).await?;
        let rule = self.cache.scoring_rule(round).await?;
        let questions = self.cache.analyzer().questions();
        // Rank needs the whole partition, so it stays unset on this path.
        let grade = compute_for_student(student_id, &sheets, &registry, &rule, questions);
        state
            .by_student
            .insert(student_id.to_string(), grade.clone());
        Ok(Some(grade))
    }

    pub async fn grades_for(
        &self,
        round: &str,
        student_ids: &[String],
    ) -> Result<Vec<StudentGrade>, CacheError> {
        let mut out = Vec::new();
        for student_id in student_ids {
            if let Some(grade) = self.grade_for(round, student_id).await? {
                out.push(grade);
            }
        }
        Ok(out)
    }

    /// Seeded sample over the barcode-only identity index. Ids are
    /// deduplicated and sorted before the shuffle, so identical data and
    /// seed always yield the identical ordered sample.
    pub async fn random_sample_student_ids(
        &self,
        round: &str,
        count: usize,
        seed: u64,
    ) -> Result<Vec<String>, CacheError> {
        let index = self.cache.student_id_by_image(round).await?;
        let mut ids: Vec<String> = index
            .values()
            .cloned()
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();
        let mut rng = StdRng::seed_from_u64(seed);
        ids.shuffle(&mut rng);
        ids.truncate(count);
        Ok(ids)
    }
}

fn compute_round(
    round: &str,
    sheets: &[SheetResult],
    registry: &StudentRegistry,
    rule: &ScoringRule,
    questions: usize,
) -> GradedRound {
    // BTreeMap keeps grade output ordered by student id.
    let mut by_student: BTreeMap<&str, Vec<&SheetResult>> = BTreeMap::new();
    for sheet in sheets {
        if let Some(student_id) = sheet.student_id.as_deref().filter(|id| !id.is_empty()) {
            by_student.entry(student_id).or_default().push(sheet);
        }
    }

    let mut grades: Vec<StudentGrade> = by_student
        .into_iter()
        .map(|(student_id, student_sheets)| {
            compute_student(student_id, &student_sheets, registry, rule, questions)
        })
        .collect();

    rank(&mut grades);
    let summary = build_summary(round, &mut grades, sheets, registry);

    let index: HashMap<String, usize> = grades
        .iter()
        .enumerate()
        .map(|(i, grade)| (grade.student_id.clone(), i))
        .collect();
    GradedRound {
        grades: Arc::new(grades),
        index: Arc::new(index),
        summary: Arc::new(summary),
    }
}

/// Aggregates one student's sheets into a grade.
///
/// Two different totals on purpose: `total_score_raw` sums the raw
/// per-question sums and drives ranking; `total_score` sums the
/// per-question averages and is what users see. Unifying them would change
/// ranking outcomes.
pub fn compute_for_student(
    student_id: &str,
    sheets: &[SheetResult],
    registry: &StudentRegistry,
    rule: &ScoringRule,
    questions: usize,
) -> StudentGrade {
    let refs: Vec<&SheetResult> = sheets.iter().collect();
    compute_student(student_id, &refs, registry, rule, questions)
}

fn compute_student(
    student_id: &str,
    sheets: &[&SheetResult],
    registry: &StudentRegistry,
    rule: &ScoringRule,
    questions: usize,
) -> StudentGrade {
    let mut grade = StudentGrade::new(student_id, questions);
    if let Some(row) = registry.find(student_id) {
        grade.name = row.name.clone();
        grade.registration_number = row.registration_number.clone();
        grade.exam_type = row.exam_type.clone();
        grade.school = row.school.clone();
        grade.birth_date = row.birth_date;
    }

    grade.interviewer_count = sheets.len();
    grade.is_simple_error = sheets.len() <= SIMPLE_ERROR_MAX_INTERVIEWERS;
    for sheet in sheets {
        if sheet.is_duplicate {
            grade.is_duplicate = true;
            grade.duplicate_count += 1;
        }
    }

    let mut raw_total: Option<f64> = None;
    for question_index in 0..questions {
        let mut sum = 0.0;
        let mut contributors = 0usize;
        for sheet in sheets {
            let Some(option) = sheet.markings.get(question_index).copied().flatten() else {
                continue;
            };
            sum += rule.score(question_index as u32 + 1, option);
            contributors += 1;
        }
        if contributors > 0 {
            grade.question_averages[question_index] = Some(sum / contributors as f64);
            raw_total = Some(raw_total.unwrap_or(0.0) + sum);
        }
    }
    grade.total_score_raw = raw_total;

    let averages: Vec<f64> = grade.question_averages.iter().flatten().copied().collect();
    if !averages.is_empty() {
        let total: f64 = averages.iter().sum();
        grade.total_score = Some(total);
        grade.average_score = Some(total / averages.len() as f64);
    }
    grade
}

/// Competition ranking within exam-type partitions. Only grades with a
/// non-empty exam type and a present raw total participate; everyone else
/// keeps `rank = None`. Sort order is descending `(total_score_raw,
/// total_score)`, but rank equality is judged on the raw total alone, so
/// tied raw totals share a rank and the next distinct rank skips ahead by
/// the tie-group size (10, 10, 8 ranks as 1, 1, 3).
pub fn rank(grades: &mut [StudentGrade]) {
    let mut partitions: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, grade) in grades.iter_mut().enumerate() {
        grade.rank = None;
        if !grade.exam_type.trim().is_empty() && grade.total_score_raw.is_some() {
            partitions.entry(grade.exam_type.clone()).or_default().push(i);
        }
    }

    for members in partitions.values_mut() {
        members.sort_by(|&a, &b| {
            let (ga, gb) = (&grades[a], &grades[b]);
            let raw_a = ga.total_score_raw.unwrap_or(f64::MIN);
            let raw_b = gb.total_score_raw.unwrap_or(f64::MIN);
            raw_b.total_cmp(&raw_a).then_with(|| {
                gb.total_score
                    .unwrap_or(f64::MIN)
                    .total_cmp(&ga.total_score.unwrap_or(f64::MIN))
            })
        });

        let mut previous_raw = f64::NAN;
        let mut previous_rank = 0u32;
        for (position, &i) in members.iter().enumerate() {
            let raw = grades[i].total_score_raw.unwrap_or(f64::MIN);
            let assigned = if raw == previous_raw {
                previous_rank
            } else {
                position as u32 + 1
            };
            grades[i].rank = Some(assigned);
            previous_raw = raw;
            previous_rank = assigned;
        }
    }
}

/// Round-wide verification summary plus the registry reconciliation pass:
/// graded students missing from the registry are forced into the
/// simple-error state with an appended detail.
pub fn build_summary(
    round: &str,
    grades: &mut [StudentGrade],
    sheets: &[SheetResult],
    registry: &StudentRegistry,
) -> RoundSummary {
    let registry_ids: HashSet<&str> = registry.student_ids().collect();
    let graded_ids: HashSet<String> = grades.iter().map(|g| g.student_id.clone()).collect();

    let mut unregistered: Vec<String> = Vec::new();
    for grade in grades.iter_mut() {
        if !registry_ids.contains(grade.student_id.as_str()) {
            grade.is_simple_error = true;
            grade.push_detail("not in registry");
            unregistered.push(grade.student_id.clone());
        }
    }
    unregistered.sort();

    let mut ungraded: Vec<String> = registry_ids
        .iter()
        .filter(|id| !graded_ids.contains(**id))
        .map(|id| id.to_string())
        .collect();
    ungraded.sort();

    let error_sheets: Vec<String> = sheets
        .iter()
        .filter(|sheet| sheet.has_errors)
        .map(|sheet| {
            format!(
                "{}: {}",
                sheet.image_id,
                sheet.error_message.as_deref().unwrap_or_default()
            )
        })
        .collect();

    let duplicate_students: Vec<String> = grades
        .iter()
        .filter(|grade| grade.is_duplicate)
        .map(|grade| grade.student_id.clone())
        .collect();

    // Null-combined-id entries: students holding a rank come first in rank
    // order, everything else follows alphabetically.
    let rank_by_student: HashMap<&str, u32> = grades
        .iter()
        .filter_map(|g| g.rank.map(|r| (g.student_id.as_str(), r)))
        .collect();
    let mut ranked: BTreeSet<(u32, String)> = BTreeSet::new();
    let mut unranked: BTreeSet<String> = BTreeSet::new();
    for sheet in sheets.iter().filter(|s| s.combined_id().is_none()) {
        let label = sheet
            .student_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&sheet.image_id);
        match sheet
            .student_id
            .as_deref()
            .and_then(|id| rank_by_student.get(id))
        {
            Some(&r) => {
                ranked.insert((r, label.to_string()));
            }
            None => {
                unranked.insert(label.to_string());
            }
        }
    }
    let null_combined_id: Vec<String> = ranked
        .into_iter()
        .map(|(_, label)| label)
        .chain(unranked)
        .collect();

    RoundSummary {
        round: round.to_string(),
        sheet_count: sheets.len(),
        student_count: grades.len(),
        error_sheets: TruncatedList::new(error_sheets),
        duplicate_students: TruncatedList::new(duplicate_students),
        null_combined_id: TruncatedList::new(null_combined_id),
        unregistered_students: TruncatedList::new(unregistered),
        ungraded_students: TruncatedList::new(ungraded),
    }
}

use crate::analyze::SheetAnalyzer;
use crate::duplicate::{apply_duplicates, detect_duplicates};
use crate::model::{Document, ScoringRule, Session, SheetResult, StudentRegistry};
use crate::store::{RoundStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("background task failed")]
    Task(#[from] task::JoinError),
}

/// Explicit cache-slot state. Every slot belongs to the round recorded on
/// the state that holds it; a round switch resets all slots to `Empty`.
#[derive(Debug, Clone)]
pub enum Slot<T> {
    Empty,
    Loaded(T),
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot::Empty
    }
}

impl<T: Clone> Slot<T> {
    pub fn get(&self) -> Option<T> {
        match self {
            Slot::Empty => None,
            Slot::Loaded(value) => Some(value.clone()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Slot::Loaded(_))
    }
}

#[derive(Default)]
struct CacheState {
    round: Option<String>,
    session: Slot<Arc<Session>>,
    scoring_rule: Slot<Arc<ScoringRule>>,
    registry: Slot<Arc<StudentRegistry>>,
    documents_by_id: Slot<Arc<HashMap<String, Document>>>,
    student_id_by_image: Slot<Arc<HashMap<String, String>>>,
    all_sheets: Slot<Arc<Vec<SheetResult>>>,
    /// Complete when `all_sheets` is loaded; otherwise holds per-student
    /// memos from the subset path, which may coexist with an unpopulated
    /// full cache.
    sheets_by_student: HashMap<String, Arc<Vec<SheetResult>>>,
}

/// Round-scoped memoization over session loads and sheet analysis. One
/// exclusive gate serializes every check/compute/store sequence; CPU-bound
/// recomputation runs on the blocking pool while the gate is held, so
/// callers stay serialized without pinning a runtime worker.
///
/// Explicitly constructed and injectable; the round key is a parameter on
/// every operation, and a key mismatch invalidates all slots atomically
/// before the access proceeds.
pub struct AnalysisCache {
    store: Arc<dyn RoundStore>,
    analyzer: SheetAnalyzer,
    state: Mutex<CacheState>,
}

impl AnalysisCache {
    pub fn new(store: Arc<dyn RoundStore>, analyzer: SheetAnalyzer) -> Self {
        Self {
            store,
            analyzer,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn analyzer(&self) -> &SheetAnalyzer {
        &self.analyzer
    }

    /// Locks the state, invalidating every slot first if the resident round
    /// differs from the requested one.
    async fn state_for(&self, round: &str) -> MutexGuard<'_, CacheState> {
        let mut state = self.state.lock().await;
        if state.round.as_deref() != Some(round) {
            if let Some(previous) = state.round.as_deref() {
                debug!(from = previous, to = round, "round switch, analysis cache cleared");
            }
            *state = CacheState {
                round: Some(round.to_string()),
                ..CacheState::default()
            };
        }
        state
    }

    pub async fn session(&self, round: &str) -> Result<Arc<Session>, CacheError> {
        let mut state = self.state_for(round).await;
        self.session_locked(&mut state, round).await
    }

    async fn session_locked(
        &self,
        state: &mut CacheState,
        round: &str,
    ) -> Result<Arc<Session>, CacheError> {
        if let Some(session) = state.session.get() {
            return Ok(session);
        }
        let store = Arc::clone(&self.store);
        let key = round.to_string();
        let session = task::spawn_blocking(move || store.load_session(&key)).await??;
        info!(round, documents = session.documents.len(), "session loaded");
        let session = Arc::new(session);
        state.session = Slot::Loaded(Arc::clone(&session));
        Ok(session)
    }

    pub async fn scoring_rule(&self, round: &str) -> Result<Arc<ScoringRule>, CacheError> {
        let mut state = self.state_for(round).await;
        if let Some(rule) = state.scoring_rule.get() {
            return Ok(rule);
        }
        let store = Arc::clone(&self.store);
        let key = round.to_string();
        let rule = Arc::new(task::spawn_blocking(move || store.load_scoring_rule(&key)).await??);
        state.scoring_rule = Slot::Loaded(Arc::clone(&rule));
        Ok(rule)
    }

    pub async fn registry(&self, round: &str) -> Result<Arc<StudentRegistry>, CacheError> {
        let mut state = self.state_for(round).await;
        if let Some(registry) = state.registry.get() {
            return Ok(registry);
        }
        let store = Arc::clone(&self.store);
        let key = round.to_string();
        let registry = Arc::new(task::spawn_blocking(move || store.load_registry(&key)).await??);
        info!(round, students = registry.students.len(), "registry loaded");
        state.registry = Slot::Loaded(Arc::clone(&registry));
        Ok(registry)
    }

    pub async fn document(
        &self,
        round: &str,
        image_id: &str,
    ) -> Result<Option<Document>, CacheError> {
        let mut state = self.state_for(round).await;
        if let Some(index) = state.documents_by_id.get() {
            return Ok(index.get(image_id).cloned());
        }
        let session = self.session_locked(&mut state, round).await?;
        let index: HashMap<String, Document> = session
            .documents
            .iter()
            .map(|doc| (doc.image_id.clone(), doc.clone()))
            .collect();
        let index = Arc::new(index);
        state.documents_by_id = Slot::Loaded(Arc::clone(&index));
        Ok(index.get(image_id).cloned())
    }

    /// Barcode-only identity index. Built without any marking analysis so
    /// identity lookups (sampling, single-student queries) stay cheap.
    pub async fn student_id_by_image(
        &self,
        round: &str,
    ) -> Result<Arc<HashMap<String, String>>, CacheError> {
        let mut state = self.state_for(round).await;
        self.student_id_by_image_locked(&mut state, round).await
    }

    async fn student_id_by_image_locked(
        &self,
        state: &mut CacheState,
        round: &str,
    ) -> Result<Arc<HashMap<String, String>>, CacheError> {
        if let Some(index) = state.student_id_by_image.get() {
            return Ok(index);
        }
        let session = self.session_locked(state, round).await?;
        let mut index = HashMap::new();
        for doc in &session.documents {
            let Some(barcodes) = session.barcodes_for(&doc.image_id) else {
                continue;
            };
            if let Some(student_id) = self.analyzer.identity(barcodes).student_id {
                index.insert(doc.image_id.clone(), student_id);
            }
        }
        let index = Arc::new(index);
        state.student_id_by_image = Slot::Loaded(Arc::clone(&index));
        Ok(index)
    }

    /// Analyzes the whole session once per epoch, applies duplicate
    /// detection to the fresh set, and derives the per-student index from
    /// it.
    pub async fn all_sheet_results(&self, round: &str) -> Result<Arc<Vec<SheetResult>>, CacheError> {
        let mut state = self.state_for(round).await;
        if let Some(sheets) = state.all_sheets.get() {
            return Ok(sheets);
        }
        let session = self.session_locked(&mut state, round).await?;
        let analyzer = self.analyzer.clone();
        let sheets = task::spawn_blocking(move || {
            let mut results = analyzer.analyze_all(&session);
            let groups = detect_duplicates(&results);
            apply_duplicates(&mut results, &groups);
            results
        })
        .await?;
        info!(round, sheets = sheets.len(), "full sheet analysis complete");

        let mut index: HashMap<String, Vec<SheetResult>> = HashMap::new();
        for result in &sheets {
            if let Some(student_id) = result.student_id.as_deref().filter(|id| !id.is_empty()) {
                index
                    .entry(student_id.to_string())
                    .or_default()
                    .push(result.clone());
            }
        }
        state.sheets_by_student = index
            .into_iter()
            .map(|(student_id, results)| (student_id, Arc::new(results)))
            .collect();
        let sheets = Arc::new(sheets);
        state.all_sheets = Slot::Loaded(Arc::clone(&sheets));
        Ok(sheets)
    }

    /// Sheet results for one student. Fast path serves the index derived
    /// from the full analysis; the slow path analyzes only that student's
    /// images through the barcode index and memoizes the subset without
    /// populating the full cache.
    pub async fn sheet_results_for_student(
        &self,
        round: &str,
        student_id: &str,
    ) -> Result<Vec<SheetResult>, CacheError> {
        if student_id.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state_for(round).await;
        if state.all_sheets.is_loaded() {
            return Ok(state
                .sheets_by_student
                .get(student_id)
                .map(|results| results.as_ref().clone())
                .unwrap_or_default());
        }
        if let Some(results) = state.sheets_by_student.get(student_id) {
            return Ok(results.as_ref().clone());
        }

        let identity_index = self.student_id_by_image_locked(&mut state, round).await?;
        let image_ids: HashSet<String> = identity_index
            .iter()
            .filter(|(_, sid)| sid.as_str() == student_id)
            .map(|(image_id, _)| image_id.clone())
            .collect();
        let session = self.session_locked(&mut state, round).await?;
        let analyzer = self.analyzer.clone();
        let results = task::spawn_blocking(move || {
            let mut results = analyzer.analyze_images(&session, &image_ids);
            let groups = detect_duplicates(&results);
            apply_duplicates(&mut results, &groups);
            results
        })
        .await?;
        debug!(round, student_id, sheets = results.len(), "subset analysis memoized");
        state
            .sheets_by_student
            .insert(student_id.to_string(), Arc::new(results.clone()));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_transitions_are_observable() {
        let mut slot: Slot<u32> = Slot::default();
        assert!(!slot.is_loaded());
        assert_eq!(slot.get(), None);
        slot = Slot::Loaded(7);
        assert!(slot.is_loaded());
        assert_eq!(slot.get(), Some(7));
    }
}

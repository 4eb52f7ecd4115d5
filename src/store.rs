use crate::model::{ScoringRule, Session, StudentRegistry};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("round not found: {0}")]
    RoundNotFound(String),
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Load side of a round's persisted resources. Implementations are opaque
/// collaborators; the cache only cares that a failed load surfaces as an
/// error on the triggering call instead of a synthesized default.
pub trait RoundStore: Send + Sync {
    fn load_session(&self, round: &str) -> Result<Session, StoreError>;
    fn load_scoring_rule(&self, round: &str) -> Result<ScoringRule, StoreError>;
    fn load_registry(&self, round: &str) -> Result<StudentRegistry, StoreError>;
}

#[derive(Clone)]
struct RoundData {
    session: Session,
    scoring_rule: ScoringRule,
    registry: StudentRegistry,
}

/// In-memory store with rounds registered up front. Used by tests and by
/// embedders that already hold the round data.
#[derive(Default, Clone)]
pub struct MemoryRoundStore {
    rounds: HashMap<String, RoundData>,
}

impl MemoryRoundStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_round(
        &mut self,
        round: impl Into<String>,
        session: Session,
        scoring_rule: ScoringRule,
        registry: StudentRegistry,
    ) {
        self.rounds.insert(
            round.into(),
            RoundData {
                session,
                scoring_rule,
                registry,
            },
        );
    }

    fn round(&self, round: &str) -> Result<&RoundData, StoreError> {
        self.rounds
            .get(round)
            .ok_or_else(|| StoreError::RoundNotFound(round.to_string()))
    }
}

impl RoundStore for MemoryRoundStore {
    fn load_session(&self, round: &str) -> Result<Session, StoreError> {
        Ok(self.round(round)?.session.clone())
    }

    fn load_scoring_rule(&self, round: &str) -> Result<ScoringRule, StoreError> {
        Ok(self.round(round)?.scoring_rule.clone())
    }

    fn load_registry(&self, round: &str) -> Result<StudentRegistry, StoreError> {
        Ok(self.round(round)?.registry.clone())
    }
}

/// Filesystem store: one folder per round under `root`, holding
/// `session.json`, `scoring_rule.json` and `registry.json`.
pub struct DirRoundStore {
    root: PathBuf,
}

impl DirRoundStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_json<T: DeserializeOwned>(&self, round: &str, file: &str) -> Result<T, StoreError> {
        let dir = self.root.join(round);
        if !dir.is_dir() {
            return Err(StoreError::RoundNotFound(round.to_string()));
        }
        let path = dir.join(file);
        let text = read_text(&path)?;
        serde_json::from_str(&text).map_err(|source| StoreError::Parse { path, source })
    }
}

fn read_text(path: &Path) -> Result<String, StoreError> {
    fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl RoundStore for DirRoundStore {
    fn load_session(&self, round: &str) -> Result<Session, StoreError> {
        self.read_json(round, "session.json")
    }

    fn load_scoring_rule(&self, round: &str) -> Result<ScoringRule, StoreError> {
        self.read_json(round, "scoring_rule.json")
    }

    fn load_registry(&self, round: &str) -> Result<StudentRegistry, StoreError> {
        self.read_json(round, "registry.json")
    }
}

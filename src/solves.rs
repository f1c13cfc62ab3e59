use chrono::Utc;
use serde_derive::Serialize;
use std::sync::Arc;

use crate::model::SolveRecord;
use crate::store::{ExerciseCatalog, SolveRepository};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    /// First correct submission; `score` points were awarded.
    New { score: u32 },
    AlreadySolved,
}

impl SolveOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, SolveOutcome::New { .. })
    }
}

/// Per-exercise numbers for a scoreboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExerciseStats {
    pub exercise_id: String,
    pub solve_count: u64,
    pub score: u32,
    pub is_dynamic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub username: String,
    pub total_solves: u64,
    pub total_score: u64,
}

/// Records first-time solves. The store's uniqueness on (user, exercise)
/// decides which of several concurrent submissions wins.
pub struct SolveRecorder {
    catalog: Arc<dyn ExerciseCatalog>,
    solves: Arc<dyn SolveRepository>,
}

impl SolveRecorder {
    pub fn new(catalog: Arc<dyn ExerciseCatalog>, solves: Arc<dyn SolveRepository>) -> Self {
        SolveRecorder { catalog, solves }
    }

    pub async fn record_solve(&self, username: &str, exercise_id: &str) -> Result<SolveOutcome> {
        let exercise = self.catalog.lookup(exercise_id).await?;

        let record = SolveRecord {
            username: username.to_string(),
            exercise_id: exercise_id.to_string(),
            score: exercise.score,
            solved_at: Utc::now(),
        };

        if self.solves.save_if_absent(&record).await? {
            log::info!(
                "{} solved {} for {} points",
                username,
                exercise_id,
                exercise.score
            );
            Ok(SolveOutcome::New {
                score: exercise.score,
            })
        } else {
            log::debug!("{} had already solved {}", username, exercise_id);
            Ok(SolveOutcome::AlreadySolved)
        }
    }

    pub async fn has_solved(&self, username: &str, exercise_id: &str) -> Result<bool> {
        Ok(self
            .solves
            .find_by_username_and_exercise(username, exercise_id)
            .await?
            .is_some())
    }

    pub async fn solve_count(&self, exercise_id: &str) -> Result<u64> {
        self.solves.count_by_exercise(exercise_id).await
    }

    pub async fn solved_by(&self, username: &str) -> Result<Vec<SolveRecord>> {
        self.solves.find_by_username(username).await
    }

    pub async fn total_score(&self, username: &str) -> Result<u64> {
        Ok(self
            .solved_by(username)
            .await?
            .iter()
            .map(|s| u64::from(s.score))
            .sum())
    }

    /// Activity feed, newest first.
    pub async fn recent_solves(&self, limit: usize) -> Result<Vec<SolveRecord>> {
        self.solves.find_recent(limit).await
    }

    /// Leaderboard by number of exercises solved.
    pub async fn top_solvers(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        self.solves.top_solvers(limit).await
    }

    pub async fn most_solved_exercises(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        self.solves.most_solved(limit).await
    }

    pub async fn exercise_stats(&self, exercise_id: &str) -> Result<ExerciseStats> {
        let exercise = self.catalog.lookup(exercise_id).await?;

        Ok(ExerciseStats {
            exercise_id: exercise.exercise_id,
            solve_count: self.solve_count(exercise_id).await?,
            score: exercise.score,
            is_dynamic: exercise.is_dynamic,
        })
    }

    pub async fn user_stats(&self, username: &str) -> Result<UserStats> {
        let solved = self.solved_by(username).await?;

        Ok(UserStats {
            username: username.to_string(),
            total_solves: solved.len() as u64,
            total_score: solved.iter().map(|s| u64::from(s.score)).sum(),
        })
    }
}

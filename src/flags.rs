//! Decides whether a submitted flag is correct.
//!
//! Dynamic exercises are checked against the digest stored with the user's
//! running instance; static exercises against the catalog's fixed flag. Every
//! lookup failure counts as a wrong answer.

use std::sync::Arc;

use crate::model::{ExerciseDescriptor, InstanceState};
use crate::secret;
use crate::store::{ExerciseCatalog, InstanceRepository};

pub struct FlagRouter {
    catalog: Arc<dyn ExerciseCatalog>,
    instances: Arc<dyn InstanceRepository>,
}

impl FlagRouter {
    pub fn new(catalog: Arc<dyn ExerciseCatalog>, instances: Arc<dyn InstanceRepository>) -> Self {
        FlagRouter { catalog, instances }
    }

    pub async fn validate(&self, username: &str, exercise_id: &str, submission: Option<&str>) -> bool {
        let exercise = match self.catalog.lookup(exercise_id).await {
            Ok(exercise) => exercise,
            Err(e) => {
                log::warn!("Rejecting submission for {}: {}", exercise_id, e);
                return false;
            }
        };

        let correct = if exercise.is_dynamic {
            self.validate_dynamic(username, exercise_id, submission).await
        } else {
            validate_static(&exercise, submission)
        };

        log::info!(
            "{} submitted a {} flag for {} ({})",
            username,
            if correct { "correct" } else { "wrong" },
            exercise_id,
            if exercise.is_dynamic { "dynamic" } else { "static" }
        );
        correct
    }

    async fn validate_dynamic(
        &self,
        username: &str,
        exercise_id: &str,
        submission: Option<&str>,
    ) -> bool {
        let submission = match submission {
            Some(submission) => submission,
            None => return false,
        };

        let running = match self
            .instances
            .find_by_username_and_exercise_and_state(username, exercise_id, InstanceState::Running)
            .await
        {
            Ok(running) => running,
            Err(e) => {
                log::warn!("Unable to look up instance of {} for {}: {}", username, exercise_id, e);
                return false;
            }
        };

        let instance = match running.first() {
            Some(instance) => instance,
            None => {
                log::debug!("{} has no running instance of {}", username, exercise_id);
                return false;
            }
        };

        secret::digests_match(&secret::digest(submission), &instance.secret_digest)
    }
}

fn validate_static(exercise: &ExerciseDescriptor, submission: Option<&str>) -> bool {
    match (exercise.static_flag.as_deref(), submission) {
        (Some(expected), Some(submitted)) => expected == submitted,
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn exercise(flag: Option<&str>) -> ExerciseDescriptor {
        ExerciseDescriptor {
            exercise_id: "web-2".into(),
            image_reference: "ctf-web-2".into(),
            is_dynamic: false,
            static_flag: flag.map(String::from),
            score: 50,
        }
    }

    #[test]
    fn static_comparison_is_exact() {
        let ex = exercise(Some("FLAG{x}"));

        assert!(validate_static(&ex, Some("FLAG{x}")));
        assert!(!validate_static(&ex, Some("FLAG{X}")));
        assert!(!validate_static(&ex, Some("FLAG{x} ")));
        assert!(!validate_static(&ex, Some("")));
        assert!(!validate_static(&ex, None));
    }

    #[test]
    fn missing_static_flag_never_matches() {
        let ex = exercise(None);

        assert!(!validate_static(&ex, Some("")));
        assert!(!validate_static(&ex, None));
    }
}

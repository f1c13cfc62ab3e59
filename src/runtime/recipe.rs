use std::{
    fs,
    path::{Path, PathBuf},
};
use tempdir::TempDir;

use crate::{validate, Error, Result};

/// Recipe used when an exercise ships none.
pub const DEFAULT_RECIPE: &str = include_str!("../../containers/default/Dockerfile");

/// Checked in order, relative to the exercise directory.
const RECIPE_CANDIDATES: &[&str] = &["Dockerfile", "docker/Dockerfile", "container/Dockerfile"];

/// Directory and recipe file handed to `docker build`.
#[derive(Debug)]
pub struct BuildContext {
    pub context_dir: PathBuf,
    pub recipe: PathBuf,
    // Holds the synthesized recipe until the build is done.
    scratch: Option<TempDir>,
}

impl BuildContext {
    pub fn resolve(exercises_dir: &Path, exercise_id: &str) -> Result<Self> {
        validate::exercise_id(exercise_id)?;

        let exercise_dir = exercises_dir.join(exercise_id);
        if exercise_dir.is_dir() {
            if let Some(recipe) = find_recipe(&exercise_dir) {
                log::debug!("Using recipe {} for {}", recipe.display(), exercise_id);
                return Ok(BuildContext {
                    context_dir: exercise_dir,
                    recipe,
                    scratch: None,
                });
            }
        }

        let scratch = TempDir::new("sandbox-recipe")
            .map_err(|e| Error::UnableToCreateTempDir { source: e })?;
        let recipe = scratch.path().join("Dockerfile");
        fs::write(&recipe, DEFAULT_RECIPE).map_err(|e| Error::UnableToWriteRecipe { source: e })?;

        let context_dir = if exercise_dir.is_dir() {
            exercise_dir
        } else {
            scratch.path().to_path_buf()
        };

        log::info!(
            "No recipe found for {}, using the default one (context {})",
            exercise_id,
            context_dir.display()
        );

        Ok(BuildContext {
            context_dir,
            recipe,
            scratch: Some(scratch),
        })
    }

    pub fn is_synthesized(&self) -> bool {
        self.scratch.is_some()
    }
}

fn find_recipe(exercise_dir: &Path) -> Option<PathBuf> {
    RECIPE_CANDIDATES
        .iter()
        .map(|candidate| exercise_dir.join(candidate))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod test {
    use super::*;

    fn exercises() -> TempDir {
        TempDir::new("exercises").expect("Unable to create exercises dir")
    }

    #[test]
    fn prefers_top_level_recipe() {
        let root = exercises();
        let dir = root.path().join("rev-1");
        fs::create_dir_all(dir.join("docker")).unwrap();
        fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
        fs::write(dir.join("docker/Dockerfile"), "FROM alpine\n").unwrap();

        let ctx = BuildContext::resolve(root.path(), "rev-1").unwrap();
        assert_eq!(ctx.context_dir, dir);
        assert_eq!(ctx.recipe, dir.join("Dockerfile"));
        assert!(!ctx.is_synthesized());
    }

    #[test]
    fn finds_nested_recipe() {
        let root = exercises();
        let dir = root.path().join("web-2");
        fs::create_dir_all(dir.join("container")).unwrap();
        fs::write(dir.join("container/Dockerfile"), "FROM alpine\n").unwrap();

        let ctx = BuildContext::resolve(root.path(), "web-2").unwrap();
        assert_eq!(ctx.context_dir, dir);
        assert_eq!(ctx.recipe, dir.join("container/Dockerfile"));
    }

    #[test]
    fn synthesizes_recipe_inside_existing_exercise() {
        let root = exercises();
        let dir = root.path().join("pwn-3");
        fs::create_dir_all(&dir).unwrap();

        let ctx = BuildContext::resolve(root.path(), "pwn-3").unwrap();
        assert!(ctx.is_synthesized());
        assert_eq!(ctx.context_dir, dir);
        assert!(!ctx.recipe.starts_with(&dir));
        let written = fs::read_to_string(&ctx.recipe).unwrap();
        assert!(written.contains("adduser"));
        assert!(written.contains("sshd"));
    }

    #[test]
    fn synthesizes_context_for_missing_exercise() {
        let root = exercises();
        let ctx = BuildContext::resolve(root.path(), "ghost").unwrap();

        assert!(ctx.is_synthesized());
        assert_eq!(ctx.recipe, ctx.context_dir.join("Dockerfile"));
        assert!(ctx.recipe.is_file());
    }

    #[test]
    fn rejects_traversal() {
        let root = exercises();
        assert!(BuildContext::resolve(root.path(), "../etc").is_err());
    }
}

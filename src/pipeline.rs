//! Parsing of `project.yaml` pipeline definitions into structured actions.
//!
//! The pipeline file declares named actions, each with a run command (image
//! first), optional dependencies on other actions, and declared outputs
//! grouped by privacy level.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use crate::models::Privacy;

/// The wildcard action name meaning "run the whole pipeline".
pub const RUN_ALL: &str = "run_all";

/// Images which query the shared backend database. Used as a fallback when
/// the action does not carry an explicit `database_access` key.
const DATABASE_IMAGES: &[&str] = &["ehrql", "cohortextractor", "sqlrunner"];

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Could not parse project.yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("project.yaml does not define any actions")]
    NoActions,

    #[error("Action '{0}' has an empty run command")]
    EmptyRun(String),

    #[error("Action '{action}' depends on unknown action '{dependency}'")]
    UnknownDependency { action: String, dependency: String },

    #[error("Action '{action}' declares no outputs")]
    NoOutputs { action: String },

    #[error("Action '{action}' has invalid output level '{level}'")]
    InvalidOutputLevel { action: String, level: String },

    #[error("Action '{action}' has invalid output pattern '{pattern}'")]
    InvalidPattern { action: String, pattern: String },

    #[error("Action '{0}' not found in project.yaml")]
    UnknownAction(String),

    #[error("'{}' is a reserved action name", RUN_ALL)]
    ReservedActionName,
}

#[derive(Debug, Deserialize)]
struct RawPipeline {
    #[serde(default)]
    actions: BTreeMap<String, RawAction>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    run: String,
    #[serde(default)]
    needs: Vec<String>,
    #[serde(default)]
    database_access: Option<bool>,
    #[serde(default)]
    outputs: BTreeMap<String, BTreeMap<String, String>>,
}

/// One declared action, validated and normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub name: String,
    /// The full run command, image (with tag) first.
    pub run: Vec<String>,
    pub needs: Vec<String>,
    /// Declared output patterns mapped to their privacy level.
    pub outputs: BTreeMap<String, Privacy>,
    /// Whether this action queries the shared backend database.
    pub database_access: bool,
}

impl Action {
    /// Image name with tag, e.g. `ehrql:v1`.
    pub fn image(&self) -> &str {
        &self.run[0]
    }

    pub fn args(&self) -> &[String] {
        &self.run[1..]
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub actions: BTreeMap<String, Action>,
}

impl Pipeline {
    pub fn action(&self, name: &str) -> Result<&Action, PipelineError> {
        self.actions
            .get(name)
            .ok_or_else(|| PipelineError::UnknownAction(name.to_string()))
    }

    pub fn all_action_names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }
}

/// Parse and validate a `project.yaml` file.
pub fn load_pipeline(contents: &str) -> Result<Pipeline, PipelineError> {
    let raw: RawPipeline = serde_yaml::from_str(contents)?;
    if raw.actions.is_empty() {
        return Err(PipelineError::NoActions);
    }

    let action_names: Vec<String> = raw.actions.keys().cloned().collect();
    let mut actions = BTreeMap::new();
    for (name, raw_action) in raw.actions {
        if name == RUN_ALL {
            return Err(PipelineError::ReservedActionName);
        }
        let run: Vec<String> = raw_action
            .run
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        if run.is_empty() {
            return Err(PipelineError::EmptyRun(name));
        }
        for dependency in &raw_action.needs {
            if !action_names.contains(dependency) {
                return Err(PipelineError::UnknownDependency {
                    action: name,
                    dependency: dependency.clone(),
                });
            }
        }
        if raw_action.outputs.is_empty() {
            return Err(PipelineError::NoOutputs { action: name });
        }

        let mut outputs = BTreeMap::new();
        for (level, named_patterns) in &raw_action.outputs {
            let privacy = match level.as_str() {
                "highly_sensitive" => Privacy::HighlySensitive,
                "moderately_sensitive" => Privacy::ModeratelySensitive,
                other => {
                    return Err(PipelineError::InvalidOutputLevel {
                        action: name,
                        level: other.to_string(),
                    })
                }
            };
            for pattern in named_patterns.values() {
                if globset::Glob::new(pattern).is_err() {
                    return Err(PipelineError::InvalidPattern {
                        action: name,
                        pattern: pattern.clone(),
                    });
                }
                outputs.insert(pattern.clone(), privacy);
            }
        }

        let database_access = raw_action.database_access.unwrap_or_else(|| {
            let image_name = run[0].split(':').next().unwrap_or("");
            DATABASE_IMAGES.contains(&image_name)
        });

        actions.insert(
            name.clone(),
            Action {
                name,
                run,
                needs: raw_action.needs,
                outputs,
                database_access,
            },
        );
    }

    Ok(Pipeline { actions })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
version: "4"
actions:
  extract_data:
    run: ehrql:v1 generate-dataset analysis/dataset_definition.py --output output/dataset.csv
    outputs:
      highly_sensitive:
        dataset: output/dataset.csv
  run_model:
    run: r:latest analysis/model.R
    needs: [extract_data]
    outputs:
      moderately_sensitive:
        summary: output/summary.csv
"#;

    #[test]
    fn parses_actions_with_needs_and_outputs() {
        let pipeline = load_pipeline(PROJECT).unwrap();
        assert_eq!(pipeline.actions.len(), 2);

        let extract = pipeline.action("extract_data").unwrap();
        assert_eq!(extract.image(), "ehrql:v1");
        assert_eq!(extract.args()[0], "generate-dataset");
        assert!(extract.needs.is_empty());
        assert_eq!(
            extract.outputs.get("output/dataset.csv"),
            Some(&Privacy::HighlySensitive)
        );

        let model = pipeline.action("run_model").unwrap();
        assert_eq!(model.needs, vec!["extract_data"]);
    }

    #[test]
    fn database_access_inferred_from_image() {
        let pipeline = load_pipeline(PROJECT).unwrap();
        assert!(pipeline.action("extract_data").unwrap().database_access);
        assert!(!pipeline.action("run_model").unwrap().database_access);
    }

    #[test]
    fn explicit_database_access_flag_wins() {
        let contents = r#"
actions:
  summarise:
    run: python:latest analysis/summarise.py
    database_access: true
    outputs:
      moderately_sensitive:
        counts: output/counts.csv
"#;
        let pipeline = load_pipeline(contents).unwrap();
        assert!(pipeline.action("summarise").unwrap().database_access);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let contents = r#"
actions:
  run_model:
    run: r:latest analysis/model.R
    needs: [does_not_exist]
    outputs:
      moderately_sensitive:
        summary: output/summary.csv
"#;
        let err = load_pipeline(contents).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownDependency { .. }));
    }

    #[test]
    fn missing_outputs_are_rejected() {
        let contents = r#"
actions:
  run_model:
    run: r:latest analysis/model.R
"#;
        let err = load_pipeline(contents).unwrap_err();
        assert!(matches!(err, PipelineError::NoOutputs { .. }));
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        assert!(matches!(
            load_pipeline("actions: {}"),
            Err(PipelineError::NoActions)
        ));
    }
}

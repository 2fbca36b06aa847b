//! Pipeline graph validation and construction
//!
//! A definition is a strictly linear sequence of stages. Artifacts flow
//! forward only: every input must be produced by a strictly earlier stage
//! (or be the trigger's source snapshot). Validation is pure and never
//! touches external systems, so a broken definition is rejected before its
//! first run is ever triggered.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::definition::{
    MAX_APPROVAL_TIMEOUT_SECONDS, PipelineDefinition, SOURCE_ARTIFACT, StageKind, StageSpec,
};
use crate::error::{ValidationError, ValidationIssue};
use crate::permission::{Authorization, GrantSet, check_pattern};

/// One artifact-flow edge between two stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEdge {
    pub artifact: String,
    /// Producing stage, `source` for the trigger snapshot
    pub producer: String,
    pub consumer: String,
}

/// A validated view over a definition
#[derive(Debug, Clone)]
pub struct PipelineGraph<'a> {
    definition: &'a PipelineDefinition,
    producers: HashMap<&'a str, usize>,
}

impl<'a> PipelineGraph<'a> {
    pub fn build(definition: &'a PipelineDefinition) -> Result<Self, ValidationError> {
        validate(definition)?;

        let producers = definition
            .stages
            .iter()
            .enumerate()
            .flat_map(|(idx, stage)| stage.outputs.iter().map(move |o| (o.as_str(), idx)))
            .collect();

        Ok(Self {
            definition,
            producers,
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        self.definition
    }

    /// Stage producing `artifact`, `None` for the source snapshot
    pub fn producer_of(&self, artifact: &str) -> Option<&'a StageSpec> {
        self.producers
            .get(artifact)
            .map(|idx| &self.definition.stages[*idx])
    }

    pub fn edges(&self) -> Vec<ArtifactEdge> {
        self.definition
            .stages
            .iter()
            .flat_map(|stage| {
                stage.inputs.iter().map(move |input| ArtifactEdge {
                    artifact: input.clone(),
                    producer: self
                        .producer_of(input)
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| SOURCE_ARTIFACT.to_string()),
                    consumer: stage.name.clone(),
                })
            })
            .collect()
    }
}

/// Check a definition and report every issue found
pub fn validate(definition: &PipelineDefinition) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    if definition.name.trim().is_empty() {
        issues.push(ValidationIssue::EmptyPipelineName);
    }

    if definition.stages.is_empty() {
        issues.push(ValidationIssue::NoStages);
    }

    if let Some(seconds) = definition.approval_timeout_seconds {
        check_approval_timeout("the pipeline", seconds, &mut issues);
    }

    check_stage_names(&definition.stages, &mut issues);
    check_artifact_flow(&definition.stages, &mut issues);

    for stage in &definition.stages {
        check_stage_shape(stage, &mut issues);
        check_grant_patterns(stage, &mut issues);
        check_declared_actions(definition, stage, &mut issues);
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues })
    }
}

fn check_stage_names(stages: &[StageSpec], issues: &mut Vec<ValidationIssue>) {
    let mut seen = HashSet::new();

    for (index, stage) in stages.iter().enumerate() {
        if stage.name.trim().is_empty() {
            issues.push(ValidationIssue::EmptyStageName { index });
            continue;
        }
        if stage.name == SOURCE_ARTIFACT {
            issues.push(ValidationIssue::ReservedStageName(stage.name.clone()));
        }
        if !seen.insert(stage.name.as_str()) {
            issues.push(ValidationIssue::DuplicateStage(stage.name.clone()));
        }
    }
}

fn check_artifact_flow(stages: &[StageSpec], issues: &mut Vec<ValidationIssue>) {
    // First producer of each artifact, by stage index
    let mut producers: HashMap<&str, usize> = HashMap::new();

    for (idx, stage) in stages.iter().enumerate() {
        for output in &stage.outputs {
            if !is_valid_artifact_name(output) {
                issues.push(ValidationIssue::InvalidArtifactName {
                    stage: stage.name.clone(),
                    artifact: output.clone(),
                });
                continue;
            }
            if output == SOURCE_ARTIFACT {
                issues.push(ValidationIssue::ReservedOutput {
                    stage: stage.name.clone(),
                    artifact: output.clone(),
                });
                continue;
            }
            if let Some(first) = producers.get(output.as_str()) {
                issues.push(ValidationIssue::DuplicateOutput {
                    artifact: output.clone(),
                    first: stages[*first].name.clone(),
                    second: stage.name.clone(),
                });
            } else {
                producers.insert(output.as_str(), idx);
            }
        }
    }

    for (idx, stage) in stages.iter().enumerate() {
        for input in &stage.inputs {
            if input == SOURCE_ARTIFACT {
                continue;
            }
            if !is_valid_artifact_name(input) {
                issues.push(ValidationIssue::InvalidArtifactName {
                    stage: stage.name.clone(),
                    artifact: input.clone(),
                });
                continue;
            }
            match producers.get(input.as_str()) {
                Some(producer) if *producer < idx => {}
                Some(producer) if *producer == idx => {
                    issues.push(ValidationIssue::SelfReference {
                        stage: stage.name.clone(),
                        artifact: input.clone(),
                    });
                }
                Some(producer) => {
                    issues.push(ValidationIssue::ForwardReference {
                        stage: stage.name.clone(),
                        artifact: input.clone(),
                        producer: stages[*producer].name.clone(),
                    });
                }
                None => {
                    issues.push(ValidationIssue::UnresolvedInput {
                        stage: stage.name.clone(),
                        artifact: input.clone(),
                    });
                }
            }
        }
    }
}

/// Artifact names become file names in a stage workspace
fn is_valid_artifact_name(name: &str) -> bool {
    !name.trim().is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn check_approval_timeout(scope: &str, seconds: u64, issues: &mut Vec<ValidationIssue>) {
    if seconds == 0 || seconds > MAX_APPROVAL_TIMEOUT_SECONDS {
        issues.push(ValidationIssue::ApprovalTimeoutOutOfRange {
            scope: scope.to_string(),
            seconds,
        });
    }
}

fn check_stage_shape(stage: &StageSpec, issues: &mut Vec<ValidationIssue>) {
    if let Some(seconds) = stage.approval.as_ref().and_then(|a| a.timeout_seconds) {
        check_approval_timeout(&format!("stage '{}'", stage.name), seconds, issues);
    }

    match stage.kind {
        StageKind::Approval => {
            if !stage.inputs.is_empty() || !stage.outputs.is_empty() {
                issues.push(ValidationIssue::ApprovalWithArtifacts(stage.name.clone()));
            }
            if stage.execution.is_some() {
                issues.push(ValidationIssue::ApprovalWithExecution(stage.name.clone()));
            }
        }
        StageKind::Build | StageKind::Deploy => {
            let has_image = stage
                .execution
                .as_ref()
                .is_some_and(|e| !e.image.trim().is_empty());
            if !has_image {
                issues.push(ValidationIssue::MissingImage(stage.name.clone()));
            }
        }
    }
}

fn check_grant_patterns(stage: &StageSpec, issues: &mut Vec<ValidationIssue>) {
    for grant in &stage.grants {
        for pattern in [&grant.identity, &grant.resource] {
            if let Err(e) = check_pattern(pattern) {
                issues.push(ValidationIssue::InvalidGrantPattern {
                    stage: stage.name.clone(),
                    pattern: pattern.clone(),
                    reason: e.msg.to_string(),
                });
            }
        }
    }
}

fn check_declared_actions(
    definition: &PipelineDefinition,
    stage: &StageSpec,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(execution) = stage.execution.as_ref() else {
        return;
    };

    let grants = GrantSet::new(stage.grants.clone());
    let identity = definition.executor_identity(&stage.name);

    for declared in &execution.actions {
        if grants.authorize(&identity, &declared.action, &declared.resource) == Authorization::Deny
        {
            issues.push(ValidationIssue::UngrantedAction {
                stage: stage.name.clone(),
                action: declared.action.clone(),
                resource: declared.resource.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::permission::PermissionGrant;

    fn build(name: &str) -> StageSpec {
        StageSpec::build(name, "alpine:3")
    }

    fn deploy(name: &str) -> StageSpec {
        StageSpec::deploy(name, "alpine:3")
    }

    fn issues(definition: &PipelineDefinition) -> Vec<ValidationIssue> {
        validate(definition).unwrap_err().issues
    }

    #[test]
    fn test_accepts_build_approval_deploy() {
        let definition = PipelineDefinition::new(
            "app",
            vec![
                build("build").with_inputs(["source"]).with_outputs(["image"]),
                StageSpec::approval("approve"),
                deploy("deploy").with_inputs(["image", "source"]),
            ],
        );

        assert!(validate(&definition).is_ok());
    }

    #[test]
    fn test_rejects_empty_definition() {
        let definition = PipelineDefinition::new("app", vec![]);
        assert_eq!(issues(&definition), vec![ValidationIssue::NoStages]);
    }

    #[test]
    fn test_rejects_duplicate_stage_names() {
        let definition = PipelineDefinition::new("app", vec![build("build"), build("build")]);
        assert_eq!(
            issues(&definition),
            vec![ValidationIssue::DuplicateStage("build".to_string())]
        );
    }

    #[test]
    fn test_rejects_input_never_produced() {
        let definition = PipelineDefinition::new(
            "app",
            vec![build("build").with_inputs(["image"])],
        );
        assert_eq!(
            issues(&definition),
            vec![ValidationIssue::UnresolvedInput {
                stage: "build".to_string(),
                artifact: "image".to_string(),
            }]
        );
    }

    #[test]
    fn test_rejects_forward_and_self_references() {
        let definition = PipelineDefinition::new(
            "app",
            vec![
                deploy("deploy").with_inputs(["image"]),
                build("build").with_inputs(["bundle"]).with_outputs(["image", "bundle"]),
            ],
        );

        let found = issues(&definition);
        assert!(found.contains(&ValidationIssue::ForwardReference {
            stage: "deploy".to_string(),
            artifact: "image".to_string(),
            producer: "build".to_string(),
        }));
        assert!(found.contains(&ValidationIssue::SelfReference {
            stage: "build".to_string(),
            artifact: "bundle".to_string(),
        }));
    }

    #[test]
    fn test_rejects_approval_with_artifacts() {
        let mut approval = StageSpec::approval("approve");
        approval.outputs.push("ticket".to_string());

        let definition = PipelineDefinition::new("app", vec![approval]);
        assert_eq!(
            issues(&definition),
            vec![ValidationIssue::ApprovalWithArtifacts("approve".to_string())]
        );
    }

    #[test]
    fn test_rejects_reserved_and_duplicate_outputs() {
        let definition = PipelineDefinition::new(
            "app",
            vec![
                build("one").with_outputs(["source", "image"]),
                build("two").with_outputs(["image"]),
            ],
        );

        let found = issues(&definition);
        assert!(found.contains(&ValidationIssue::ReservedOutput {
            stage: "one".to_string(),
            artifact: "source".to_string(),
        }));
        assert!(found.contains(&ValidationIssue::DuplicateOutput {
            artifact: "image".to_string(),
            first: "one".to_string(),
            second: "two".to_string(),
        }));
    }

    #[test]
    fn test_rejects_ungranted_declared_action() {
        let definition = PipelineDefinition::new(
            "app",
            vec![
                build("build")
                    .with_grant(PermissionGrant::for_stage("registry/*", ["registry:pull"]))
                    .with_action("registry:push", "registry/app"),
            ],
        );

        assert_eq!(
            issues(&definition),
            vec![ValidationIssue::UngrantedAction {
                stage: "build".to_string(),
                action: "registry:push".to_string(),
                resource: "registry/app".to_string(),
            }]
        );
    }

    #[test]
    fn test_rejects_artifact_names_that_escape_the_workspace() {
        let definition = PipelineDefinition::new(
            "app",
            vec![
                build("build").with_outputs(["../../etc/cron.d/x", "image"]),
                deploy("deploy").with_inputs(["image", ".."]),
            ],
        );

        assert_eq!(
            issues(&definition),
            vec![
                ValidationIssue::InvalidArtifactName {
                    stage: "build".to_string(),
                    artifact: "../../etc/cron.d/x".to_string(),
                },
                ValidationIssue::InvalidArtifactName {
                    stage: "deploy".to_string(),
                    artifact: "..".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_rejects_malformed_grant_pattern() {
        let definition = PipelineDefinition::new(
            "app",
            vec![
                build("build")
                    .with_grant(PermissionGrant::for_stage("registry/[app", ["registry:pull"])),
            ],
        );

        let found = issues(&definition);
        assert_eq!(found.len(), 1);
        assert!(matches!(
            &found[0],
            ValidationIssue::InvalidGrantPattern { stage, pattern, .. }
                if stage == "build" && pattern == "registry/[app"
        ));
    }

    #[test]
    fn test_rejects_approval_timeouts_out_of_range() {
        let definition = PipelineDefinition::new(
            "app",
            vec![
                StageSpec::approval("never").with_approval_timeout(0),
                StageSpec::approval("forever").with_approval_timeout(u64::MAX),
                StageSpec::approval("day").with_approval_timeout(86_400),
            ],
        )
        .with_approval_timeout(MAX_APPROVAL_TIMEOUT_SECONDS + 1);

        assert_eq!(
            issues(&definition),
            vec![
                ValidationIssue::ApprovalTimeoutOutOfRange {
                    scope: "the pipeline".to_string(),
                    seconds: MAX_APPROVAL_TIMEOUT_SECONDS + 1,
                },
                ValidationIssue::ApprovalTimeoutOutOfRange {
                    scope: "stage 'never'".to_string(),
                    seconds: 0,
                },
                ValidationIssue::ApprovalTimeoutOutOfRange {
                    scope: "stage 'forever'".to_string(),
                    seconds: u64::MAX,
                },
            ]
        );
    }

    #[test]
    fn test_reports_every_issue() {
        let mut missing_image = build("build");
        missing_image.execution = None;

        let definition = PipelineDefinition::new(
            " ",
            vec![missing_image, deploy("deploy").with_inputs(["nothing"])],
        );

        let found = issues(&definition);
        assert_eq!(found.len(), 3);
        assert!(found.contains(&ValidationIssue::EmptyPipelineName));
        assert!(found.contains(&ValidationIssue::MissingImage("build".to_string())));
    }

    #[test]
    fn test_graph_edges() {
        let definition = PipelineDefinition::new(
            "app",
            vec![
                build("build").with_inputs(["source"]).with_outputs(["image"]),
                StageSpec::approval("approve"),
                deploy("deploy").with_inputs(["image"]),
            ],
        );

        let graph = PipelineGraph::build(&definition).unwrap();
        assert_eq!(
            graph.edges(),
            vec![
                ArtifactEdge {
                    artifact: "source".to_string(),
                    producer: "source".to_string(),
                    consumer: "build".to_string(),
                },
                ArtifactEdge {
                    artifact: "image".to_string(),
                    producer: "build".to_string(),
                    consumer: "deploy".to_string(),
                },
            ]
        );
        assert_eq!(graph.producer_of("image").map(|s| s.name.as_str()), Some("build"));
        assert!(graph.producer_of("source").is_none());
    }
}

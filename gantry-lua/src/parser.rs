//! Pipeline definition parser
//!
//! Evaluates a Lua definition in the sandbox and reads the returned table
//! into a [`PipelineDefinition`]. Parsing only checks shape (types and
//! required fields); [`compile_definition`] additionally runs graph
//! validation so callers get every definition problem up front.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use mlua::{Table, Value};

use gantry_core::domain::definition::{
    ApprovalConfig, DeclaredAction, ExecutionConfig, PipelineDefinition, StageKind, StageSpec,
};
use gantry_core::domain::permission::PermissionGrant;

use crate::sandbox::create_sandbox;

/// Parse and validate a definition
///
/// Validation failures are returned as a [`gantry_core::ValidationError`]
/// inside the `anyhow::Error`, so callers can `downcast_ref` it to report
/// individual issues.
///
/// # Example
/// ```no_run
/// use gantry_lua::compile_definition;
///
/// let source = r#"
///     return pipeline.define {
///         name = "service",
///         branch = "main",
///         stages = {
///             pipeline.build {
///                 name = "build",
///                 image = "rust:1",
///                 inputs = { "source" },
///                 outputs = { "binary" },
///             },
///             pipeline.approval { name = "release", approvers = { "alice" } },
///             pipeline.deploy {
///                 name = "deploy",
///                 image = "alpine:3",
///                 inputs = { "binary" },
///             },
///         },
///     }
/// "#;
///
/// let definition = compile_definition(source)?;
/// assert_eq!(definition.stages.len(), 3);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn compile_definition(source: &str) -> Result<PipelineDefinition> {
    let definition = parse_definition(source)?;
    gantry_core::validate(&definition)?;
    Ok(definition)
}

/// Parse a definition without graph validation
pub fn parse_definition(source: &str) -> Result<PipelineDefinition> {
    let lua = create_sandbox().context("Failed to create definition sandbox")?;

    let table: Table = lua
        .load(source)
        .eval()
        .context("Failed to evaluate pipeline definition")?;

    let name: String = table
        .get("name")
        .context("Pipeline must have a 'name' field")?;
    let description: Option<String> = table.get("description").ok();
    let branch: Option<String> = table
        .get("branch")
        .context("Field 'branch' must be a string")?;
    let approval_timeout: Option<u64> = table
        .get("approval_timeout")
        .context("Field 'approval_timeout' must be a number of seconds")?;

    let stages_table: Table = table
        .get("stages")
        .context("Pipeline must have a 'stages' field")?;

    let mut stages = Vec::new();
    for (index, entry) in stages_table.sequence_values::<Table>().enumerate() {
        let stage_table = entry.with_context(|| format!("Stage #{} must be a table", index + 1))?;
        stages.push(parse_stage(&stage_table, index)?);
    }

    let mut definition = PipelineDefinition::new(name, stages);
    definition.description = description;
    definition.approval_timeout_seconds = approval_timeout;
    if let Some(branch) = branch {
        definition = definition.with_branch(branch);
    }

    Ok(definition)
}

fn parse_stage(table: &Table, index: usize) -> Result<StageSpec> {
    let name: String = table
        .get("name")
        .with_context(|| format!("Stage #{} must have a 'name' field", index + 1))?;

    let kind: StageKind = match table.get::<Option<String>>("kind")? {
        Some(kind) => kind.parse().map_err(|e: String| anyhow!("Stage '{}': {}", name, e))?,
        None => {
            return Err(anyhow!(
                "Stage '{}' must be declared with pipeline.build, pipeline.deploy or pipeline.approval",
                name
            ));
        }
    };

    let inputs = string_list(table, "inputs").with_context(|| format!("Stage '{}'", name))?;
    let outputs = string_list(table, "outputs").with_context(|| format!("Stage '{}'", name))?;
    let mut grants = parse_grants(table).with_context(|| format!("Stage '{}'", name))?;

    let execution = parse_execution(table).with_context(|| format!("Stage '{}'", name))?;

    let approval = match kind {
        StageKind::Approval => {
            let gate = format!("gate/{}", name);
            for approver in string_list(table, "approvers")? {
                grants.push(PermissionGrant::new(
                    approver,
                    gate.clone(),
                    [gantry_core::domain::permission::APPROVAL_ACTION],
                ));
            }
            Some(ApprovalConfig {
                timeout_seconds: table
                    .get("timeout")
                    .with_context(|| format!("Stage '{}': 'timeout' must be a number", name))?,
            })
        }
        StageKind::Build | StageKind::Deploy => None,
    };

    Ok(StageSpec {
        name,
        kind,
        inputs,
        outputs,
        grants,
        execution,
        approval,
    })
}

/// Execution config is read whenever an image is present, so an approval
/// stage carrying one is reported by validation rather than dropped.
fn parse_execution(table: &Table) -> Result<Option<ExecutionConfig>> {
    let Some(image) = table.get::<Option<String>>("image")? else {
        return Ok(None);
    };

    let mut execution = ExecutionConfig::new(image);
    execution.command = string_list(table, "command")?;
    execution.privileged = table.get::<Option<bool>>("privileged")?.unwrap_or(false);
    execution.timeout_seconds = table
        .get("timeout")
        .context("'timeout' must be a number of seconds")?;

    if let Some(env) = table.get::<Option<Table>>("env")? {
        let mut vars = BTreeMap::new();
        for pair in env.pairs::<String, String>() {
            let (key, value) = pair.context("'env' must map strings to strings")?;
            vars.insert(key, value);
        }
        execution.env = vars;
    }

    if let Some(actions) = table.get::<Option<Table>>("actions")? {
        for entry in actions.sequence_values::<Table>() {
            let action = entry.context("'actions' must be a list of tables")?;
            execution.actions.push(DeclaredAction {
                action: action
                    .get("action")
                    .context("Declared action needs an 'action' field")?,
                resource: action
                    .get("resource")
                    .context("Declared action needs a 'resource' field")?,
            });
        }
    }

    Ok(Some(execution))
}

/// Grants are written as `{ identity?, actions, resources }`; each resource
/// becomes its own grant.
fn parse_grants(table: &Table) -> Result<Vec<PermissionGrant>> {
    let Some(grants) = table.get::<Option<Table>>("grants")? else {
        return Ok(Vec::new());
    };

    let mut parsed = Vec::new();
    for entry in grants.sequence_values::<Table>() {
        let grant = entry.context("'grants' must be a list of tables")?;
        let identity: String = grant
            .get::<Option<String>>("identity")?
            .unwrap_or_else(|| "*".to_string());
        let actions = string_list(&grant, "actions")?;
        if actions.is_empty() {
            return Err(anyhow!("Grant must list at least one action"));
        }

        let resources = match grant.get::<Value>("resource")? {
            Value::String(resource) => vec![resource.to_str()?.to_string()],
            _ => string_list(&grant, "resources")?,
        };
        if resources.is_empty() {
            return Err(anyhow!("Grant must name at least one resource"));
        }

        for resource in resources {
            parsed.push(PermissionGrant::new(
                identity.clone(),
                resource,
                actions.clone(),
            ));
        }
    }

    Ok(parsed)
}

fn string_list(table: &Table, field: &str) -> Result<Vec<String>> {
    match table.get::<Value>(field)? {
        Value::Nil => Ok(Vec::new()),
        Value::Table(list) => list
            .sequence_values::<String>()
            .map(|v| v.with_context(|| format!("Field '{}' must be a list of strings", field)))
            .collect(),
        _ => Err(anyhow!("Field '{}' must be a list of strings", field)),
    }
}

//! Pipeline definition parser
//!
//! Evaluates a `pipeline.lua` script in the sandbox and converts the returned
//! table into a [`PipelineDefinition`]. The result is validated as a topology
//! before it is returned, so anything this function accepts can be
//! instantiated for an environment.

use anyhow::{Context, Result, anyhow, bail};
use convoy_core::domain::action::{
    Action, BuildSpec, DEFAULT_GRACE_PERIOD_SECS, DeploySpec, ExecutionEnv, ImageBuild,
    MigrationSpec, SecretRef,
};
use convoy_core::domain::artifact::{ArtifactKind, ArtifactRef, OutputSlot};
use convoy_core::domain::environment::{
    BranchFallback, EnvironmentConfig, EnvironmentTable, RuntimeParameters,
};
use convoy_core::domain::pipeline::{PipelineDefinition, SourceSpec, Stage};
use mlua::{Table, Value};
use std::collections::BTreeMap;

use crate::modules::pipeline::KIND_FIELD;
use crate::sandbox::create_sandbox;

/// Parse and validate a pipeline definition from Lua source code
///
/// # Arguments
/// * `source` - The Lua source code, returning `pipeline.define { ... }`
///
/// # Returns
/// The validated pipeline definition
///
/// # Errors
/// Returns an error if:
/// - The Lua source is invalid
/// - Required fields are missing or have the wrong type
/// - The stage/action topology is invalid
///
/// # Example
/// ```no_run
/// use convoy_lua::parser::parse_pipeline_definition;
///
/// let source = r#"
///     return pipeline.define {
///         name = "svc-deploy",
///         service = "svc",
///         source = { repository = "https://git.example.com/svc.git" },
///         stages = {
///             pipeline.stage {
///                 name = "build",
///                 actions = {
///                     pipeline.build {
///                         id = "image",
///                         commands = { "make test" },
///                         outputs = { image = "image-ref" },
///                         image = { repository = "registry/svc" },
///                     },
///                 },
///             },
///             pipeline.stage {
///                 name = "deploy",
///                 actions = { pipeline.deploy { id = "rollout", image = "build/image" } },
///             },
///         },
///     }
/// "#;
///
/// let definition = parse_pipeline_definition(source)?;
/// assert_eq!(definition.stages.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn parse_pipeline_definition(source: &str) -> Result<PipelineDefinition> {
    let lua = create_sandbox().context("Failed to create definition sandbox")?;

    let pipeline: Table = lua
        .load(source)
        .eval()
        .context("Failed to evaluate pipeline definition")?;

    let name = required_string(&pipeline, "name", "Pipeline")?;
    let service = required_string(&pipeline, "service", "Pipeline")?;
    let description = optional_string(&pipeline, "description", "Pipeline")?;

    let source_table: Table = pipeline
        .get::<Option<Table>>("source")?
        .context("Pipeline must have a 'source' table")?;
    let repository = required_string(&source_table, "repository", "Pipeline source")?;

    let environments = parse_environments(&pipeline)?;
    let stages = parse_stages(&pipeline)?;

    let definition = PipelineDefinition {
        name,
        description,
        service,
        source: SourceSpec { repository },
        environments,
        stages,
    };

    definition
        .validate()
        .with_context(|| format!("Invalid pipeline '{}'", definition.name))?;

    Ok(definition)
}

// =============================================================================
// Environments
// =============================================================================

fn parse_environments(pipeline: &Table) -> Result<EnvironmentTable> {
    let fallback = match optional_string(pipeline, "branch_fallback", "Pipeline")?.as_deref() {
        None | Some("environment") => BranchFallback::EnvironmentName,
        Some("reject") => BranchFallback::Reject,
        Some(other) => bail!(
            "Field 'branch_fallback' must be \"environment\" or \"reject\", got \"{}\"",
            other
        ),
    };

    let default_runtime = match pipeline.get::<Option<Table>>("default_runtime")? {
        Some(table) => parse_runtime(&table, &RuntimeParameters::default(), "default_runtime")?,
        None => RuntimeParameters::default(),
    };

    let mut entries = BTreeMap::new();
    if let Some(table) = pipeline.get::<Option<Table>>("environments")? {
        for pair in table.pairs::<String, Table>() {
            let (name, env_table) =
                pair.context("Field 'environments' must map names to tables")?;
            let owner = format!("Environment '{}'", name);

            let branch = required_string(&env_table, "branch", &owner)?;
            let runtime = match env_table.get::<Option<Table>>("runtime")? {
                Some(runtime) => Some(parse_runtime(&runtime, &default_runtime, &owner)?),
                None => None,
            };

            entries.insert(name, EnvironmentConfig { branch, runtime });
        }
    }

    EnvironmentTable::new(entries, fallback, default_runtime)
        .context("Invalid environment table")
}

fn parse_runtime(
    table: &Table,
    defaults: &RuntimeParameters,
    owner: &str,
) -> Result<RuntimeParameters> {
    let read_u32 = |field: &str, default: u32| -> Result<u32> {
        Ok(table
            .get::<Option<u32>>(field)
            .with_context(|| format!("Field '{}' of {} must be an integer", field, owner))?
            .unwrap_or(default))
    };
    let read_f64 = |field: &str, default: f64| -> Result<f64> {
        Ok(table
            .get::<Option<f64>>(field)
            .with_context(|| format!("Field '{}' of {} must be a number", field, owner))?
            .unwrap_or(default))
    };

    Ok(RuntimeParameters {
        desired_count: read_u32("desired", defaults.desired_count)?,
        min_capacity: read_u32("min", defaults.min_capacity)?,
        max_capacity: read_u32("max", defaults.max_capacity)?,
        cpu_target: read_f64("cpu_target", defaults.cpu_target)?,
        memory_target: read_f64("memory_target", defaults.memory_target)?,
    })
}

// =============================================================================
// Stages and actions
// =============================================================================

fn parse_stages(pipeline: &Table) -> Result<Vec<Stage>> {
    let stages_table: Table = pipeline
        .get::<Option<Table>>("stages")?
        .context("Pipeline must have a 'stages' field")?;

    let mut stages = Vec::new();

    for (ordinal, entry) in stages_table.sequence_values::<Table>().enumerate() {
        let stage_table = entry.context("Failed to read stage entry")?;
        let name = required_string(&stage_table, "name", &format!("Stage #{}", ordinal + 1))?;
        let owner = format!("Stage '{}'", name);

        let actions_table: Table = stage_table
            .get::<Option<Table>>("actions")?
            .with_context(|| format!("{} must have an 'actions' field", owner))?;

        let mut actions = Vec::new();
        for (index, entry) in actions_table.sequence_values::<Table>().enumerate() {
            let action_table =
                entry.with_context(|| format!("Failed to read action #{} of {}", index + 1, owner))?;
            actions.push(parse_action(&action_table, index, &owner)?);
        }

        stages.push(Stage::new(name, ordinal as u32, actions));
    }

    Ok(stages)
}

fn parse_action(table: &Table, index: usize, stage_owner: &str) -> Result<Action> {
    let kind = optional_string(table, KIND_FIELD, "Action")?.ok_or_else(|| {
        anyhow!(
            "Action #{} of {} must be created with pipeline.build, pipeline.migrate or pipeline.deploy",
            index + 1,
            stage_owner
        )
    })?;
    let id = required_string(table, "id", &format!("Action #{} of {}", index + 1, stage_owner))?;
    let owner = format!("Action '{}'", id);

    let action = match kind.as_str() {
        "build" => parse_build(table, id, &owner)?,
        "migrate" => parse_migrate(table, id, &owner)?,
        "deploy" => parse_deploy(table, id, &owner)?,
        other => bail!("{} has unknown kind '{}'", owner, other),
    };

    match table
        .get::<Option<u32>>("concurrency")
        .with_context(|| format!("Field 'concurrency' of {} must be an integer", owner))?
    {
        Some(limit) => Ok(action.with_concurrency_limit(limit)),
        None => Ok(action),
    }
}

fn parse_build(table: &Table, id: String, owner: &str) -> Result<Action> {
    let env = parse_execution_env(table, owner)?;
    let inputs = parse_inputs(table, owner)?;

    let mut outputs = Vec::new();
    if let Some(outputs_table) = table.get::<Option<Table>>("outputs")? {
        // Lua table iteration order is unspecified
        let mut declared = BTreeMap::new();
        for pair in outputs_table.pairs::<String, String>() {
            let (slot, kind) = pair
                .with_context(|| format!("Field 'outputs' of {} must map slots to kinds", owner))?;
            declared.insert(slot, kind);
        }
        for (slot, kind) in declared {
            let kind = kind
                .parse::<ArtifactKind>()
                .map_err(|e: String| anyhow!("{} output '{}': {}", owner, slot, e))?;
            outputs.push(OutputSlot { slot, kind });
        }
    }

    let image = match table.get::<Option<Table>>("image")? {
        Some(image) => {
            let image_owner = format!("Image of {}", owner);
            Some(ImageBuild {
                repository: required_string(&image, "repository", &image_owner)?,
                dockerfile: optional_string(&image, "dockerfile", &image_owner)?
                    .unwrap_or_else(|| "Dockerfile".to_string()),
                context: optional_string(&image, "context", &image_owner)?
                    .unwrap_or_else(|| ".".to_string()),
                push: image
                    .get::<Option<bool>>("push")
                    .with_context(|| format!("Field 'push' of {} must be a boolean", image_owner))?
                    .unwrap_or(true),
            })
        }
        None => None,
    };
    let manifest_path = optional_string(table, "manifest", owner)?;

    Ok(Action::build(
        id,
        env,
        inputs,
        outputs,
        BuildSpec {
            image,
            manifest_path,
        },
    ))
}

fn parse_migrate(table: &Table, id: String, owner: &str) -> Result<Action> {
    let env = parse_execution_env(table, owner)?;
    let inputs = parse_inputs(table, owner)?;
    let database = required_string(table, "database", owner)?;
    let secret = required_string(table, "secret", owner)?;

    Ok(Action::migrate(
        id,
        env,
        inputs,
        MigrationSpec {
            database,
            secret: SecretRef(secret),
        },
    ))
}

fn parse_deploy(table: &Table, id: String, owner: &str) -> Result<Action> {
    let image = required_string(table, "image", owner)?;
    let image = ArtifactRef::parse(&image).with_context(|| format!("{} has an invalid image", owner))?;

    let grace_period_secs = table
        .get::<Option<u64>>("grace_period")
        .with_context(|| format!("Field 'grace_period' of {} must be an integer", owner))?
        .unwrap_or(DEFAULT_GRACE_PERIOD_SECS);
    let min_healthy_percent = table
        .get::<Option<u32>>("min_healthy_percent")
        .with_context(|| format!("Field 'min_healthy_percent' of {} must be an integer", owner))?
        .unwrap_or(100);

    if min_healthy_percent == 0 || min_healthy_percent > 100 {
        bail!(
            "Field 'min_healthy_percent' of {} must be between 1 and 100",
            owner
        );
    }

    Ok(Action::deploy(
        id,
        DeploySpec {
            image,
            grace_period_secs,
            min_healthy_percent,
        },
    ))
}

fn parse_execution_env(table: &Table, owner: &str) -> Result<ExecutionEnv> {
    let container = optional_string(table, "container", owner)?;
    let commands = string_list(table, "commands", owner)?.unwrap_or_default();

    let mut env_vars = BTreeMap::new();
    if let Some(env_table) = table.get::<Option<Table>>("env")? {
        for pair in env_table.pairs::<String, String>() {
            let (key, value) = pair
                .with_context(|| format!("Field 'env' of {} must map names to strings", owner))?;
            env_vars.insert(key, value);
        }
    }

    Ok(ExecutionEnv {
        container,
        commands,
        env_vars,
    })
}

/// Inputs default to the source bundle when the field is absent
fn parse_inputs(table: &Table, owner: &str) -> Result<Vec<ArtifactRef>> {
    match string_list(table, "inputs", owner)? {
        None => Ok(vec![ArtifactRef::source()]),
        Some(inputs) => inputs
            .iter()
            .map(|input| {
                ArtifactRef::parse(input).with_context(|| format!("{} has an invalid input", owner))
            })
            .collect(),
    }
}

// =============================================================================
// Field helpers
// =============================================================================

fn required_string(table: &Table, field: &str, owner: &str) -> Result<String> {
    optional_string(table, field, owner)?
        .ok_or_else(|| anyhow!("{} must have a '{}' field", owner, field))
}

fn optional_string(table: &Table, field: &str, owner: &str) -> Result<Option<String>> {
    table
        .get::<Option<String>>(field)
        .with_context(|| format!("Field '{}' of {} must be a string", field, owner))
}

fn string_list(table: &Table, field: &str, owner: &str) -> Result<Option<Vec<String>>> {
    match table.get::<Value>(field)? {
        Value::Nil => Ok(None),
        Value::Table(list) => list
            .sequence_values::<String>()
            .collect::<mlua::Result<Vec<_>>>()
            .map(Some)
            .with_context(|| format!("Field '{}' of {} must be an array of strings", field, owner)),
        _ => bail!("Field '{}' of {} must be an array of strings", field, owner),
    }
}

//! `pipeline` module for definition scripts
//!
//! Constructors tag each action table with its kind so the parser can tell a
//! build from a migration or a deploy without guessing from field names.

use mlua::prelude::*;

use crate::module::ConvoyModule;

/// Field the action constructors write the action kind into
pub const KIND_FIELD: &str = "kind";

/// Provides `pipeline.define`, `pipeline.stage` and the action constructors
pub struct PipelineModule;

impl PipelineModule {
    fn tagged_constructor(lua: &Lua, kind: &'static str) -> LuaResult<LuaFunction> {
        lua.create_function(move |_, action: LuaTable| {
            action.set(KIND_FIELD, kind)?;
            Ok(action)
        })
    }
}

impl ConvoyModule for PipelineModule {
    fn id(&self) -> &'static str {
        "pipeline"
    }

    fn register(&self, lua: &Lua) -> LuaResult<()> {
        let pipeline = lua.create_table()?;

        // pipeline.define(definition) and pipeline.stage(config) return their table as-is
        pipeline.set(
            "define",
            lua.create_function(|_, definition: LuaTable| Ok(definition))?,
        )?;
        pipeline.set(
            "stage",
            lua.create_function(|_, stage: LuaTable| Ok(stage))?,
        )?;

        pipeline.set("build", Self::tagged_constructor(lua, "build")?)?;
        pipeline.set("migrate", Self::tagged_constructor(lua, "migrate")?)?;
        pipeline.set("deploy", Self::tagged_constructor(lua, "deploy")?)?;

        lua.globals().set(self.id(), pipeline)?;
        Ok(())
    }

    fn stubs(&self) -> String {
        r#"---@meta

---Deployment pipeline definitions
---@class pipeline
pipeline = {}

---@class RuntimeParameters
---@field desired integer? Initial desired task count
---@field min integer? Minimum capacity
---@field max integer? Maximum capacity
---@field cpu_target number? Target CPU utilization (percent)
---@field memory_target number? Target memory utilization (percent)

---@class EnvironmentConfig
---@field branch string Source branch deployed to this environment
---@field runtime RuntimeParameters?

---@class ImageBuild
---@field repository string Registry-qualified repository; tagged with the source revision
---@field dockerfile string? Defaults to "Dockerfile"
---@field context string? Defaults to "."
---@field push boolean? Defaults to true

---@class BuildAction
---@field id string
---@field container string? Image the commands run in
---@field commands string[]?
---@field env table<string, string>?
---@field inputs string[]? Artifact references "<stage>/<slot>"; defaults to { "source/bundle" }
---@field outputs table<string, "image-ref"|"manifest">?
---@field image ImageBuild?
---@field manifest string? JSON file written by the commands
---@field concurrency integer?

---@class MigrateAction
---@field id string
---@field container string?
---@field commands string[]?
---@field env table<string, string>?
---@field inputs string[]?
---@field database string Target database identity, suffixed with `.<environment>` at run time
---@field secret string Connection secret name, suffixed with `.<environment>` at run time
---@field concurrency integer? Must be 1

---@class DeployAction
---@field id string
---@field image string Reference to an image-ref artifact, "<stage>/<slot>"
---@field grace_period integer? Health check window in seconds
---@field min_healthy_percent integer?
---@field concurrency integer?

---@class Stage
---@field name string
---@field actions (BuildAction|MigrateAction|DeployAction)[]

---@class PipelineDefinition
---@field name string
---@field service string
---@field description string?
---@field source { repository: string }
---@field environments table<string, EnvironmentConfig>?
---@field branch_fallback "environment"|"reject"?
---@field default_runtime RuntimeParameters?
---@field stages Stage[]

---Define a pipeline
---@param definition PipelineDefinition
---@return PipelineDefinition
function pipeline.define(definition) end

---Define a stage
---@param stage Stage
---@return Stage
function pipeline.stage(stage) end

---Define a build action
---@param action BuildAction
---@return BuildAction
function pipeline.build(action) end

---Define a migration action
---@param action MigrateAction
---@return MigrateAction
function pipeline.migrate(action) end

---Define a deploy action
---@param action DeployAction
---@return DeployAction
function pipeline.deploy(action) end
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_tag_kind() {
        let lua = Lua::new();
        PipelineModule.register(&lua).unwrap();

        let kind: String = lua
            .load(r#"return pipeline.migrate({ id = "m" }).kind"#)
            .eval()
            .unwrap();
        assert_eq!(kind, "migrate");

        let kind: String = lua
            .load(r#"return pipeline.deploy({ id = "d" }).kind"#)
            .eval()
            .unwrap();
        assert_eq!(kind, "deploy");
    }

    #[test]
    fn test_define_returns_table() {
        let lua = Lua::new();
        PipelineModule.register(&lua).unwrap();

        let name: String = lua
            .load(r#"return pipeline.define({ name = "svc" }).name"#)
            .eval()
            .unwrap();
        assert_eq!(name, "svc");
    }
}

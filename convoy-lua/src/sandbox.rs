//! Lua sandbox creation
//!
//! Definition scripts run in a restricted sandbox with no filesystem, network
//! or process access, and no way to load external code. The only globals
//! beyond the safe standard libraries are the definition modules.

use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib};

use crate::module::ModuleRegistry;

/// Create a restricted Lua sandbox with the builtin definition modules
///
/// # Use Cases
/// - CLI: Validate a `pipeline.lua` before registering it, or run it locally
/// - Orchestrator: Validate uploaded pipeline definitions
///
/// # Security
/// This sandbox prevents:
/// - Network access
/// - File system access
/// - Process execution
/// - Loading external modules via require()
pub fn create_sandbox() -> LuaResult<Lua> {
    create_sandbox_with(&ModuleRegistry::with_builtin())
}

/// Create a restricted sandbox and register the given modules into it
pub fn create_sandbox_with(registry: &ModuleRegistry) -> LuaResult<Lua> {
    // Only TABLE, STRING and MATH; IO, OS, PACKAGE and DEBUG stay out
    let lua = unsafe {
        Lua::unsafe_new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::default(),
        )
    };

    lua.globals().set("require", mlua::Nil)?;
    lua.globals().set("dofile", mlua::Nil)?;
    lua.globals().set("loadfile", mlua::Nil)?;
    lua.globals().set("load", mlua::Nil)?;

    registry.register_all(&lua)?;

    Ok(lua)
}

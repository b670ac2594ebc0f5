//! Init command handlers
//!
//! Generates editor support for pipeline definition scripts: stub files
//! describing the definition modules and a .luarc.json pointing at them.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use convoy_lua::{ConvoyModule, ModuleRegistry};
use std::fs;
use std::path::Path;

use crate::config::Config;

const STUBS_DIR: &str = ".convoy/stubs";

/// Init subcommands
#[derive(Subcommand)]
pub enum InitCommands {
    /// Generate Lua development files (.luarc.json and stubs)
    Lua {
        /// Output directory for generated files
        #[arg(short, long, default_value = ".")]
        output: String,

        /// Generate only .luarc.json
        #[arg(long, conflicts_with = "stubs_only")]
        config_only: bool,

        /// Generate only stub files
        #[arg(long)]
        stubs_only: bool,
    },
}

/// Handle init commands
pub async fn handle_init_command(command: InitCommands, _config: &Config) -> Result<()> {
    match command {
        InitCommands::Lua {
            output,
            config_only,
            stubs_only,
        } => generate_lua_dev_files(Path::new(&output), config_only, stubs_only),
    }
}

/// Generate Lua development files
fn generate_lua_dev_files(output_path: &Path, config_only: bool, stubs_only: bool) -> Result<()> {
    let registry = ModuleRegistry::with_builtin();

    if !stubs_only {
        generate_luarc_json(output_path, &registry)?;
    }

    if !config_only {
        generate_stub_files(output_path, &registry)?;
    }

    println!("{}", "✓ Lua development files generated!".green().bold());
    println!();
    println!("{}", "Next steps:".bold());
    println!("  1. Install Lua Language Server in your editor");
    println!("  2. Open your pipeline.lua to see autocomplete and type hints");
    println!(
        "  3. Use {} to check it and {} to register it",
        "convoy pipeline validate".cyan(),
        "convoy pipeline create".cyan()
    );

    Ok(())
}

/// Contents of .luarc.json declaring the module globals
fn luarc_json(registry: &ModuleRegistry) -> String {
    let globals = registry.globals();

    let luarc = serde_json::json!({
        "$schema": "https://raw.githubusercontent.com/sumneko/vscode-lua/master/setting/schema.json",
        "runtime": { "version": "Lua 5.4" },
        "diagnostics": { "globals": globals },
        "workspace": { "library": [STUBS_DIR], "checkThirdParty": false },
        "completion": { "callSnippet": "Both" }
    });

    format!("{:#}\n", luarc)
}

/// Generate .luarc.json for Lua LSP configuration
fn generate_luarc_json(output_path: &Path, registry: &ModuleRegistry) -> Result<()> {
    let luarc_path = output_path.join(".luarc.json");

    fs::write(&luarc_path, luarc_json(registry))
        .with_context(|| format!("Failed to write .luarc.json to {:?}", luarc_path))?;

    println!("  {} .luarc.json", "Created".green());

    Ok(())
}

/// Generate one stub file per definition module
fn generate_stub_files(output_path: &Path, registry: &ModuleRegistry) -> Result<()> {
    let stubs_dir = output_path.join(STUBS_DIR);
    fs::create_dir_all(&stubs_dir)
        .with_context(|| format!("Failed to create stubs directory at {:?}", stubs_dir))?;

    for module in registry.modules() {
        let stub_path = stubs_dir.join(format!("{}.lua", module.id()));

        fs::write(&stub_path, module.stubs())
            .with_context(|| format!("Failed to write stub file {:?}", stub_path))?;

        println!("  {} {}.lua", "Created".green(), module.id());
    }

    println!(
        "  {} in {}",
        "Stubs ready".green(),
        stubs_dir.display().to_string().cyan()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luarc_declares_pipeline_global() {
        let luarc: serde_json::Value =
            serde_json::from_str(&luarc_json(&ModuleRegistry::with_builtin())).unwrap();

        assert_eq!(luarc["diagnostics"]["globals"][0], "pipeline");
        assert_eq!(luarc["workspace"]["library"][0], STUBS_DIR);
    }

    #[test]
    fn test_generate_writes_stubs() {
        let dir = std::env::temp_dir().join(format!("convoy-init-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        generate_lua_dev_files(&dir, false, false).unwrap();

        let stub = fs::read_to_string(dir.join(STUBS_DIR).join("pipeline.lua")).unwrap();
        assert!(stub.starts_with("---@meta"));
        assert!(dir.join(".luarc.json").exists());

        fs::remove_dir_all(&dir).ok();
    }
}

use mlua::prelude::*;

/// A global table offered to pipeline definition scripts
///
/// Besides installing itself into the sandbox, a module documents its API as
/// Lua Language Server annotations so editors can check `pipeline.lua` files.
///
/// # Example
///
/// ```rust
/// use convoy_lua::ConvoyModule;
/// use mlua::prelude::*;
///
/// struct Registries;
///
/// impl ConvoyModule for Registries {
///     fn id(&self) -> &'static str {
///         "registries"
///     }
///
///     fn register(&self, lua: &Lua) -> LuaResult<()> {
///         let table = lua.create_table()?;
///         table.set("internal", "registry.example.com")?;
///         lua.globals().set(self.id(), table)
///     }
///
///     fn stubs(&self) -> String {
///         "---@meta\n---@class registries\nregistries = {}\n".to_string()
///     }
/// }
/// ```
pub trait ConvoyModule: Send + Sync {
    /// Name of the global the module installs; a Lua identifier
    fn id(&self) -> &'static str;

    /// Installs the module's global into `lua`
    fn register(&self, lua: &Lua) -> LuaResult<()>;

    /// Annotation file content, starting with `---@meta`
    fn stubs(&self) -> String;
}

/// The set of modules a definition sandbox exposes
///
/// Module globals are unique: the sandbox installs them all, and `convoy init`
/// writes one stub file per module.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn ConvoyModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The modules every definition script sees
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(crate::modules::PipelineModule);
        registry
    }

    /// Adds a module
    ///
    /// # Panics
    /// If a module with the same global is already present
    pub fn register<M: ConvoyModule + 'static>(&mut self, module: M) {
        assert!(
            !self.contains(module.id()),
            "Module with id '{}' is already registered",
            module.id()
        );
        self.modules.push(Box::new(module));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.iter().any(|module| module.id() == id)
    }

    /// Globals installed by the registered modules, in registration order
    pub fn globals(&self) -> Vec<&'static str> {
        self.modules.iter().map(|module| module.id()).collect()
    }

    pub fn modules(&self) -> &[Box<dyn ConvoyModule>] {
        &self.modules
    }

    /// Installs every module into `lua`, stopping at the first failure
    pub fn register_all(&self, lua: &Lua) -> LuaResult<()> {
        self.modules.iter().try_for_each(|module| module.register(lua))
    }

    /// All stubs concatenated into one annotation file
    pub fn generate_stubs(&self) -> String {
        self.modules
            .iter()
            .map(|module| module.stubs())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Registries;

    impl ConvoyModule for Registries {
        fn id(&self) -> &'static str {
            "registries"
        }

        fn register(&self, lua: &Lua) -> LuaResult<()> {
            let table = lua.create_table()?;
            table.set("internal", "registry.example.com")?;
            lua.globals().set(self.id(), table)
        }

        fn stubs(&self) -> String {
            "---@meta\n---@class registries\nregistries = {}".to_string()
        }
    }

    #[test]
    fn test_registered_module_is_installed() {
        let mut registry = ModuleRegistry::new();
        registry.register(Registries);
        assert!(registry.contains("registries"));
        assert!(!registry.contains("pipeline"));

        let lua = Lua::new();
        registry.register_all(&lua).unwrap();
        let registries: LuaTable = lua.globals().get("registries").unwrap();
        assert_eq!(
            registries.get::<String>("internal").unwrap(),
            "registry.example.com"
        );
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration() {
        let mut registry = ModuleRegistry::new();
        registry.register(Registries);
        registry.register(Registries);
    }

    #[test]
    fn test_builtin_registry_has_pipeline_module() {
        let registry = ModuleRegistry::with_builtin();
        assert_eq!(registry.globals(), vec!["pipeline"]);

        let stubs = registry.generate_stubs();
        assert!(stubs.starts_with("---@meta"));
        assert!(stubs.contains("function pipeline.deploy"));
    }
}

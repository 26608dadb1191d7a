//! Built-in service modules.

mod logger;

pub use logger::LoggerModule;

use crate::module::ModuleRegistry;

/// Registry preloaded with every built-in module.
pub fn builtin_modules() -> ModuleRegistry {
    let registry = ModuleRegistry::new();
    registry.insert(std::sync::Arc::new(LoggerModule));
    registry
}

use faultline_debuginfo::DebugSymbolTable;
use faultline_types::ModuleName;
use std::path::{Path, PathBuf};

/// What the reporter knows about the module running in an attached VM.
#[derive(Debug, Clone, Default)]
pub struct Script {
    name: Option<ModuleName>,
    path: Option<PathBuf>,
    debug: DebugSymbolTable,
}

impl Script {
    pub fn new(name: Option<ModuleName>, debug: DebugSymbolTable) -> Self {
        Self {
            name,
            path: None,
            debug,
        }
    }

    /// Reads debug information from the compiled module at `path`. A module
    /// without usable debug information still attaches, with an empty table.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|name| ModuleName::new(name.to_string_lossy()).ok());
        Self {
            name,
            path: Some(path.to_path_buf()),
            debug: DebugSymbolTable::load_or_empty(path),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().map(ModuleName::as_str)
    }

    pub fn display_name(&self) -> &str {
        self.name().unwrap_or("<unnamed module>")
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn debug(&self) -> &DebugSymbolTable {
        &self.debug
    }
}

//! Address resolution for compiled script modules.
//!
//! A compiled module may carry a debug chunk after its image: a file table, an
//! address-sorted line table, a symbol table with code ranges, and a tag table.
//! [`DebugSymbolTable`] loads it once and answers address queries read-only.
//! A table that failed to load stays usable and answers "unknown" to everything.

use facet::Facet;
use std::error::Error;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

mod format;

#[derive(Debug)]
pub enum DebugInfoError {
    Io {
        path: String,
        source: std::io::Error,
    },
    BadMagic {
        expected: u16,
        found: u16,
    },
    NoDebugInfo,
    Truncated {
        offset: usize,
        what: &'static str,
    },
    NegativeCount {
        table: &'static str,
        value: i16,
    },
}

impl fmt::Display for DebugInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "failed to read {path}: {source}"),
            Self::BadMagic { expected, found } => write!(
                f,
                "bad magic: expected 0x{expected:04x}, found 0x{found:04x}"
            ),
            Self::NoDebugInfo => write!(f, "module was compiled without debug info"),
            Self::Truncated { offset, what } => {
                write!(f, "debug info truncated at offset {offset} while reading {what}")
            }
            Self::NegativeCount { table, value } => {
                write!(f, "negative entry count {value} for {table} table")
            }
        }
    }
}

impl Error for DebugInfoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// First code address belonging to this file.
    pub address: u32,
    pub name: String,
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub address: u32,
    /// Zero-based, as the compiler stores it.
    pub line: i32,
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolDim {
    pub tag: i16,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Variable,
    Reference,
    Array,
    ArrayRef,
    Function,
    FunctionRef,
}

impl SymbolKind {
    fn from_ident(ident: u8) -> Option<Self> {
        match ident {
            1 => Some(Self::Variable),
            2 => Some(Self::Reference),
            3 => Some(Self::Array),
            4 => Some(Self::ArrayRef),
            9 => Some(Self::Function),
            10 => Some(Self::FunctionRef),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    StaticLocal,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Data address for variables, entry address for functions.
    pub address: u32,
    pub tag: i16,
    pub code_start: u32,
    pub code_end: u32,
    pub ident: u8,
    pub vclass: u8,
    pub name: String,
    pub dims: Vec<SymbolDim>,
}

impl Symbol {
    pub fn kind(&self) -> Option<SymbolKind> {
        SymbolKind::from_ident(self.ident)
    }

    pub fn scope(&self) -> Option<SymbolScope> {
        match self.vclass {
            0 => Some(SymbolScope::Global),
            1 => Some(SymbolScope::Local),
            2 => Some(SymbolScope::StaticLocal),
            _ => None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(
            self.kind(),
            Some(SymbolKind::Function | SymbolKind::FunctionRef)
        )
    }

    pub fn contains(&self, address: u32) -> bool {
        self.code_start <= address && address < self.code_end
    }
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub id: i16,
    pub name: String,
}

/// Debug tables of one compiled module.
#[derive(Debug, Clone, Default)]
pub struct DebugSymbolTable {
    loaded: bool,
    files: Vec<FileEntry>,
    lines: Vec<LineEntry>,
    symbols: Vec<Symbol>,
    tags: Vec<TagEntry>,
}

impl DebugSymbolTable {
    /// A table with no debug info; every query answers `None`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads a compiled module and parses the debug chunk that follows its image.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DebugInfoError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| DebugInfoError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_module_bytes(&data)
    }

    /// Like [`DebugSymbolTable::load`], but degrades to an empty table.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(table) => {
                debug!(
                    path = %path.display(),
                    files = table.files.len(),
                    lines = table.lines.len(),
                    symbols = table.symbols.len(),
                    "loaded debug info"
                );
                table
            }
            Err(DebugInfoError::NoDebugInfo) => {
                debug!(path = %path.display(), "module has no debug info");
                Self::empty()
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to load debug info");
                Self::empty()
            }
        }
    }

    /// Whether the module header advertises a debug chunk.
    pub fn is_present(module: &[u8]) -> bool {
        format::parse_module_header(module)
            .map(|header| header.flags & format::MODULE_FLAG_DEBUG != 0)
            .unwrap_or(false)
    }

    pub fn from_module_bytes(module: &[u8]) -> Result<Self, DebugInfoError> {
        let header = format::parse_module_header(module)?;
        if header.flags & format::MODULE_FLAG_DEBUG == 0 {
            return Err(DebugInfoError::NoDebugInfo);
        }
        if header.size < format::MODULE_HEADER_LEN || header.size > module.len() {
            return Err(DebugInfoError::Truncated {
                offset: header.size,
                what: "debug chunk",
            });
        }
        Self::parse(&module[header.size..])
    }

    /// Parses a bare debug chunk.
    pub fn parse(chunk: &[u8]) -> Result<Self, DebugInfoError> {
        let tables = format::parse_debug_chunk(chunk)?;
        Ok(Self::from_parts(
            tables.files,
            tables.lines,
            tables.symbols,
            tables.tags,
        ))
    }

    /// Builds a loaded table from already decoded entries.
    pub fn from_parts(
        mut files: Vec<FileEntry>,
        mut lines: Vec<LineEntry>,
        symbols: Vec<Symbol>,
        tags: Vec<TagEntry>,
    ) -> Self {
        files.sort_by_key(|file| file.address);
        lines.sort_by_key(|line| line.address);
        Self {
            loaded: true,
            files,
            lines,
            symbols,
            tags,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn lines(&self) -> &[LineEntry] {
        &self.lines
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn tags(&self) -> &[TagEntry] {
        &self.tags
    }

    pub fn line_at(&self, address: u32) -> Option<&LineEntry> {
        let after = self.lines.partition_point(|line| line.address <= address);
        after.checked_sub(1).map(|index| &self.lines[index])
    }

    /// One-based source line for `address`.
    pub fn line_number_at(&self, address: u32) -> Option<i32> {
        self.line_at(address).map(|line| line.line + 1)
    }

    pub fn file_at(&self, address: u32) -> Option<&FileEntry> {
        let after = self.files.partition_point(|file| file.address <= address);
        after.checked_sub(1).map(|index| &self.files[index])
    }

    pub fn file_name_at(&self, address: u32) -> Option<&str> {
        self.file_at(address).map(|file| file.name.as_str())
    }

    pub fn function_at(&self, address: u32) -> Option<&Symbol> {
        self.functions().find(|symbol| symbol.contains(address))
    }

    pub fn function_name_at(&self, address: u32) -> Option<&str> {
        self.function_at(address).map(|symbol| symbol.name.as_str())
    }

    pub fn function_start_address(&self, address: u32) -> Option<u32> {
        self.function_at(address).map(|symbol| symbol.code_start)
    }

    /// Entry address of `name`; an empty `file` matches any file.
    pub fn function_address(&self, name: &str, file: &str) -> Option<u32> {
        self.functions()
            .filter(|symbol| symbol.name == name)
            .find(|symbol| file.is_empty() || self.file_name_at(symbol.code_start) == Some(file))
            .map(|symbol| symbol.address)
    }

    /// First code address generated for one-based `line` of `file`.
    pub fn line_address(&self, line: i32, file: &str) -> Option<u32> {
        self.lines
            .iter()
            .filter(|entry| entry.line + 1 == line)
            .find(|entry| self.file_name_at(entry.address) == Some(file))
            .map(|entry| entry.address)
    }

    pub fn tag_name(&self, id: i16) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.id == id)
            .map(|tag| tag.name.as_str())
    }

    fn functions(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|symbol| symbol.is_function())
    }
}

//! Decoding of the compiled-module debug chunk.
//!
//! Everything is little-endian with 32-bit cells. The chunk starts with a
//! 22-byte header followed by the file, line, symbol, tag, automaton and state
//! tables, in that order. Only the first four are kept.

use crate::{DebugInfoError, FileEntry, LineEntry, Symbol, SymbolDim, TagEntry};

pub(crate) const MODULE_MAGIC: u16 = 0xF1E0;
pub(crate) const MODULE_FLAG_DEBUG: i16 = 0x02;
pub(crate) const MODULE_HEADER_LEN: usize = 10;
pub(crate) const DEBUG_MAGIC: u16 = 0xF1EF;
pub(crate) const DEBUG_HEADER_LEN: usize = 22;

pub(crate) struct DebugTables {
    pub files: Vec<FileEntry>,
    pub lines: Vec<LineEntry>,
    pub symbols: Vec<Symbol>,
    pub tags: Vec<TagEntry>,
}

pub(crate) struct ModuleHeader {
    pub size: usize,
    pub flags: i16,
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DebugInfoError> {
        let end = self
            .pos
            .checked_add(N)
            .filter(|end| *end <= self.data.len())
            .ok_or(DebugInfoError::Truncated {
                offset: self.pos,
                what,
            })?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, DebugInfoError> {
        self.take::<1>(what).map(|b| b[0])
    }

    fn i16(&mut self, what: &'static str) -> Result<i16, DebugInfoError> {
        self.take::<2>(what).map(i16::from_le_bytes)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, DebugInfoError> {
        self.take::<2>(what).map(u16::from_le_bytes)
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, DebugInfoError> {
        self.take::<4>(what).map(i32::from_le_bytes)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, DebugInfoError> {
        self.take::<4>(what).map(u32::from_le_bytes)
    }

    fn cstr(&mut self, what: &'static str) -> Result<String, DebugInfoError> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(DebugInfoError::Truncated {
                offset: self.pos,
                what,
            })?;
        let name = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(name)
    }
}

fn count(value: i16, table: &'static str) -> Result<usize, DebugInfoError> {
    usize::try_from(value).map_err(|_| DebugInfoError::NegativeCount { table, value })
}

pub(crate) fn parse_module_header(data: &[u8]) -> Result<ModuleHeader, DebugInfoError> {
    let mut reader = ByteReader::new(data);
    let size = reader.i32("module size")?;
    let magic = reader.u16("module magic")?;
    if magic != MODULE_MAGIC {
        return Err(DebugInfoError::BadMagic {
            expected: MODULE_MAGIC,
            found: magic,
        });
    }
    let _file_version = reader.u8("module file version")?;
    let _amx_version = reader.u8("module amx version")?;
    let flags = reader.i16("module flags")?;
    let size = usize::try_from(size).map_err(|_| DebugInfoError::Truncated {
        offset: 0,
        what: "module size",
    })?;
    Ok(ModuleHeader { size, flags })
}

pub(crate) fn parse_debug_chunk(data: &[u8]) -> Result<DebugTables, DebugInfoError> {
    let mut reader = ByteReader::new(data);
    let size = reader.i32("debug size")?;
    let magic = reader.u16("debug magic")?;
    if magic != DEBUG_MAGIC {
        return Err(DebugInfoError::BadMagic {
            expected: DEBUG_MAGIC,
            found: magic,
        });
    }
    let _file_version = reader.u8("debug file version")?;
    let _amx_version = reader.u8("debug amx version")?;
    let _flags = reader.i16("debug flags")?;
    let num_files = count(reader.i16("file count")?, "files")?;
    let num_lines = count(reader.i16("line count")?, "lines")?;
    let num_symbols = count(reader.i16("symbol count")?, "symbols")?;
    let num_tags = count(reader.i16("tag count")?, "tags")?;
    let _num_automatons = reader.i16("automaton count")?;
    let _num_states = reader.i16("state count")?;

    let chunk_len = usize::try_from(size)
        .ok()
        .filter(|len| *len >= DEBUG_HEADER_LEN && *len <= data.len())
        .ok_or(DebugInfoError::Truncated {
            offset: 0,
            what: "debug chunk",
        })?;
    reader.data = &data[..chunk_len];

    let mut files = Vec::with_capacity(num_files);
    for _ in 0..num_files {
        let address = reader.u32("file address")?;
        let name = reader.cstr("file name")?;
        files.push(FileEntry { address, name });
    }

    let mut lines = Vec::with_capacity(num_lines);
    for _ in 0..num_lines {
        let address = reader.u32("line address")?;
        let line = reader.i32("line number")?;
        lines.push(LineEntry { address, line });
    }

    let mut symbols = Vec::with_capacity(num_symbols);
    for _ in 0..num_symbols {
        let address = reader.u32("symbol address")?;
        let tag = reader.i16("symbol tag")?;
        let code_start = reader.u32("symbol code start")?;
        let code_end = reader.u32("symbol code end")?;
        let ident = reader.u8("symbol kind")?;
        let vclass = reader.u8("symbol class")?;
        let num_dims = count(reader.i16("symbol dimensions")?, "symbol dimensions")?;
        let name = reader.cstr("symbol name")?;
        let mut dims = Vec::with_capacity(num_dims);
        for _ in 0..num_dims {
            let tag = reader.i16("dimension tag")?;
            let size = reader.u32("dimension size")?;
            dims.push(SymbolDim { tag, size });
        }
        symbols.push(Symbol {
            address,
            tag,
            code_start,
            code_end,
            ident,
            vclass,
            name,
            dims,
        });
    }

    let mut tags = Vec::with_capacity(num_tags);
    for _ in 0..num_tags {
        let id = reader.i16("tag id")?;
        let name = reader.cstr("tag name")?;
        tags.push(TagEntry { id, name });
    }

    Ok(DebugTables {
        files,
        lines,
        symbols,
        tags,
    })
}

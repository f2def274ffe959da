use facet::Facet;
use faultline_debuginfo::{DebugSymbolTable, FileEntry, LineEntry, Symbol, SymbolKind, TagEntry};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Facet)]
struct DumpOutput {
    files: Vec<FileEntry>,
    lines: Vec<LineEntry>,
    symbols: Vec<Symbol>,
    tags: Vec<TagEntry>,
}

#[derive(Facet, Debug, PartialEq)]
struct ResolvedAddress {
    address: u32,
    function: Option<String>,
    file: Option<String>,
    line: Option<i32>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Dump { module: PathBuf, json: bool },
    Resolve {
        module: PathBuf,
        addresses: Vec<u32>,
        json: bool,
    },
    Help,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    match parse_args(std::env::args().skip(1).collect())? {
        Command::Help => println!("{}", usage()),
        Command::Dump { module, json } => {
            let table = load(&module)?;
            if json {
                let output = DumpOutput {
                    files: table.files().to_vec(),
                    lines: table.lines().to_vec(),
                    symbols: table.symbols().to_vec(),
                    tags: table.tags().to_vec(),
                };
                let encoded = facet_json::to_string_pretty(&output)
                    .map_err(|e| format!("encode debug tables: {e}"))?;
                println!("{encoded}");
            } else {
                print!("{}", render_dump(&table));
            }
        }
        Command::Resolve {
            module,
            addresses,
            json,
        } => {
            let table = load(&module)?;
            let resolved: Vec<_> = addresses
                .iter()
                .map(|address| resolve(&table, *address))
                .collect();
            if json {
                let encoded = facet_json::to_string_pretty(&resolved)
                    .map_err(|e| format!("encode resolved addresses: {e}"))?;
                println!("{encoded}");
            } else {
                for address in &resolved {
                    println!("{}", render_resolved(address));
                }
            }
        }
    }
    Ok(())
}

fn usage() -> String {
    "usage:\n  faultline-dbg dump <module.amx> [--json]\n  faultline-dbg resolve <module.amx> <addr>... [--json]".to_owned()
}

fn parse_args(args: Vec<String>) -> Result<Command, String> {
    let mut args = args.into_iter();
    let Some(command) = args.next() else {
        return Err(usage());
    };
    let mut json = false;
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            "-h" | "--help" => return Ok(Command::Help),
            flag if flag.starts_with("--") => {
                return Err(format!("unknown flag for {command}: {flag}\n\n{}", usage()));
            }
            _ => positional.push(arg),
        }
    }

    match command.as_str() {
        "dump" => match positional.as_slice() {
            [module] => Ok(Command::Dump {
                module: PathBuf::from(module),
                json,
            }),
            _ => Err(format!("dump takes exactly one module path\n\n{}", usage())),
        },
        "resolve" => {
            let mut positional = positional.into_iter();
            let module = positional
                .next()
                .ok_or_else(|| format!("missing module path\n\n{}", usage()))?;
            let addresses = positional
                .map(|raw| parse_address(&raw))
                .collect::<Result<Vec<_>, _>>()?;
            if addresses.is_empty() {
                return Err(format!("resolve needs at least one address\n\n{}", usage()));
            }
            Ok(Command::Resolve {
                module: PathBuf::from(module),
                addresses,
                json,
            })
        }
        "-h" | "--help" | "help" => Ok(Command::Help),
        other => Err(format!("unknown command: {other}\n\n{}", usage())),
    }
}

/// Hex with or without `0x`, or decimal with a `#` prefix.
fn parse_address(raw: &str) -> Result<u32, String> {
    let parsed = if let Some(decimal) = raw.strip_prefix('#') {
        decimal.parse::<u32>()
    } else {
        let hex = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        u32::from_str_radix(hex, 16)
    };
    parsed.map_err(|e| format!("invalid address {raw:?}: {e}"))
}

fn load(module: &Path) -> Result<DebugSymbolTable, String> {
    let table = DebugSymbolTable::load(module).map_err(|e| format!("{}: {e}", module.display()))?;
    debug!(
        module = %module.display(),
        files = table.files().len(),
        lines = table.lines().len(),
        symbols = table.symbols().len(),
        "loaded debug tables"
    );
    Ok(table)
}

fn resolve(table: &DebugSymbolTable, address: u32) -> ResolvedAddress {
    ResolvedAddress {
        address,
        function: table.function_name_at(address).map(str::to_owned),
        file: table.file_name_at(address).map(str::to_owned),
        line: table.line_number_at(address),
    }
}

fn render_resolved(resolved: &ResolvedAddress) -> String {
    let mut out = format!(
        "{:08x} {}",
        resolved.address,
        resolved.function.as_deref().unwrap_or("??")
    );
    match (&resolved.file, resolved.line) {
        (Some(file), Some(line)) => {
            let _ = write!(out, " at {file}:{line}");
        }
        (Some(file), None) => {
            let _ = write!(out, " at {file}");
        }
        _ => {}
    }
    out
}

fn symbol_kind(symbol: &Symbol) -> &'static str {
    match symbol.kind() {
        Some(SymbolKind::Variable) => "var",
        Some(SymbolKind::Reference) => "ref",
        Some(SymbolKind::Array) => "array",
        Some(SymbolKind::ArrayRef) => "arrayref",
        Some(SymbolKind::Function) => "func",
        Some(SymbolKind::FunctionRef) => "funcref",
        None => "?",
    }
}

fn render_dump(table: &DebugSymbolTable) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "files ({}):", table.files().len());
    for file in table.files() {
        let _ = writeln!(out, "  {:08x} {}", file.address, file.name);
    }
    let _ = writeln!(out, "lines ({}):", table.lines().len());
    for line in table.lines() {
        let _ = writeln!(out, "  {:08x} {}", line.address, line.line + 1);
    }
    let _ = writeln!(out, "symbols ({}):", table.symbols().len());
    for symbol in table.symbols() {
        let tag = table.tag_name(symbol.tag).unwrap_or("_");
        let _ = write!(
            out,
            "  {:08x} {:<8} {tag}:{}",
            symbol.address,
            symbol_kind(symbol),
            symbol.name
        );
        for dim in &symbol.dims {
            let _ = write!(out, "[{}]", dim.size);
        }
        if symbol.is_function() {
            let _ = write!(out, " code {:08x}..{:08x}", symbol.code_start, symbol.code_end);
        }
        out.push('\n');
    }
    let _ = writeln!(out, "tags ({}):", table.tags().len());
    for tag in table.tags() {
        let _ = writeln!(out, "  {:>4} {}", tag.id, tag.name);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_debuginfo::SymbolDim;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    fn table() -> DebugSymbolTable {
        DebugSymbolTable::from_parts(
            vec![FileEntry {
                address: 0,
                name: "gm.pwn".to_owned(),
            }],
            vec![
                LineEntry {
                    address: 0x08,
                    line: 0,
                },
                LineEntry {
                    address: 0x20,
                    line: 4,
                },
            ],
            vec![
                Symbol {
                    address: 0x08,
                    tag: 0,
                    code_start: 0x08,
                    code_end: 0x40,
                    ident: 9,
                    vclass: 0,
                    name: "main".to_owned(),
                    dims: Vec::new(),
                },
                Symbol {
                    address: 0x100,
                    tag: 1,
                    code_start: 0,
                    code_end: 0x200,
                    ident: 3,
                    vclass: 0,
                    name: "grid".to_owned(),
                    dims: vec![SymbolDim { tag: 1, size: 4 }, SymbolDim { tag: 1, size: 8 }],
                },
            ],
            vec![TagEntry {
                id: 1,
                name: "Float".to_owned(),
            }],
        )
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse_args(args(&["dump", "gm.amx", "--json"])),
            Ok(Command::Dump {
                module: PathBuf::from("gm.amx"),
                json: true
            })
        );
        assert_eq!(
            parse_args(args(&["resolve", "gm.amx", "0x20", "1c", "#16"])),
            Ok(Command::Resolve {
                module: PathBuf::from("gm.amx"),
                addresses: vec![0x20, 0x1C, 16],
                json: false
            })
        );
        assert_eq!(parse_args(args(&["help"])), Ok(Command::Help));
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(Vec::new()).is_err());
        assert!(parse_args(args(&["dump"])).is_err());
        assert!(parse_args(args(&["dump", "a.amx", "b.amx"])).is_err());
        assert!(parse_args(args(&["resolve", "gm.amx"])).is_err());
        assert!(parse_args(args(&["resolve", "gm.amx", "zz"])).is_err());
        assert!(parse_args(args(&["dump", "gm.amx", "--pretty"])).is_err());
        assert!(parse_args(args(&["frobnicate"])).is_err());
    }

    #[test]
    fn resolves_addresses() {
        let table = table();
        let resolved = resolve(&table, 0x24);
        assert_eq!(
            resolved,
            ResolvedAddress {
                address: 0x24,
                function: Some("main".to_owned()),
                file: Some("gm.pwn".to_owned()),
                line: Some(5),
            }
        );
        assert_eq!(render_resolved(&resolved), "00000024 main at gm.pwn:5");
        assert_eq!(render_resolved(&resolve(&table, 0x04)), "00000004 ?? at gm.pwn");
        assert_eq!(
            render_resolved(&resolve(&DebugSymbolTable::empty(), 0x04)),
            "00000004 ??"
        );
    }

    #[test]
    fn dump_lists_every_table() {
        let dump = render_dump(&table());
        assert_eq!(
            dump,
            "files (1):\n  00000000 gm.pwn\n\
             lines (2):\n  00000008 1\n  00000020 5\n\
             symbols (2):\n  00000008 func     _:main code 00000008..00000040\n  00000100 array    Float:grid[4][8]\n\
             tags (1):\n     1 Float\n"
        );
    }
}

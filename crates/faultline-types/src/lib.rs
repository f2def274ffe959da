use std::error::Error;
use std::fmt;

/// A guest VM machine word.
pub type Cell = i32;

/// Size of one guest cell in bytes.
pub const CELL_SIZE: Cell = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroId(&'static str),
    EmptyField(&'static str),
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroId(field) => write!(f, "{field} must be non-zero"),
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
        }
    }
}

impl Error for InvariantError {}

/// Identity of one guest VM instance, usually the address of its control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(u64);

impl VmId {
    pub fn new(value: u64) -> Result<Self, InvariantError> {
        if value == 0 {
            return Err(InvariantError::ZeroId("vm_id"));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm#{:x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleName(String);

impl ModuleName {
    pub fn new(value: impl Into<String>) -> Result<Self, InvariantError> {
        let value = value.into();
        if value.is_empty() {
            return Err(InvariantError::EmptyField("module_name"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Script code called a host function.
    Native,
    /// Host code started a public entry point.
    Script,
}

/// One native<->script crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    pub kind: CallKind,
    pub vm: VmId,
    pub index: Cell,
    /// Caller's frame pointer at the crossing; only meaningful for script calls.
    pub frm: Cell,
    /// Caller's instruction pointer at the crossing; only meaningful for script calls.
    pub cip: Cell,
}

impl CallRecord {
    pub fn native(vm: VmId, index: Cell) -> Self {
        Self {
            kind: CallKind::Native,
            vm,
            index,
            frm: 0,
            cip: 0,
        }
    }

    pub fn script(vm: VmId, index: Cell, frm: Cell, cip: Cell) -> Self {
        Self {
            kind: CallKind::Script,
            vm,
            index,
            frm,
            cip,
        }
    }

    pub fn is_native(&self) -> bool {
        self.kind == CallKind::Native
    }

    pub fn is_script(&self) -> bool {
        self.kind == CallKind::Script
    }
}

/// Result code of a guest execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(Cell);

impl ErrorCode {
    pub const NONE: Self = Self(0);
    pub const EXIT: Self = Self(1);
    pub const ASSERT: Self = Self(2);
    pub const STACK_ERR: Self = Self(3);
    pub const BOUNDS: Self = Self(4);
    pub const MEM_ACCESS: Self = Self(5);
    pub const INV_INSTR: Self = Self(6);
    pub const STACK_LOW: Self = Self(7);
    pub const HEAP_LOW: Self = Self(8);
    pub const CALLBACK: Self = Self(9);
    pub const NATIVE: Self = Self(10);
    pub const DIVIDE: Self = Self(11);
    pub const SLEEP: Self = Self(12);
    pub const INV_STATE: Self = Self(13);
    pub const MEMORY: Self = Self(16);
    pub const FORMAT: Self = Self(17);
    pub const VERSION: Self = Self(18);
    pub const NOT_FOUND: Self = Self(19);
    pub const INDEX: Self = Self(20);
    pub const DEBUG: Self = Self(21);
    pub const INIT: Self = Self(22);
    pub const USER_DATA: Self = Self(23);
    pub const INIT_JIT: Self = Self(24);
    pub const PARAMS: Self = Self(25);
    pub const DOMAIN: Self = Self(26);
    pub const GENERAL: Self = Self(27);

    pub const fn from_raw(code: Cell) -> Self {
        Self(code)
    }

    pub const fn get(self) -> Cell {
        self.0
    }

    pub fn is_error(self) -> bool {
        self != Self::NONE
    }

    pub fn message(self) -> &'static str {
        const MESSAGES: [&str; 28] = [
            "(none)",
            "Forced exit",
            "Assertion failed",
            "Stack/heap collision (insufficient stack size)",
            "Array index out of bounds",
            "Invalid memory access",
            "Invalid instruction",
            "Stack underflow",
            "Heap underflow",
            "No (valid) native function callback",
            "Native function failed",
            "Divide by zero",
            "(sleep mode)",
            "Invalid state",
            "(reserved)",
            "(reserved)",
            "Out of memory",
            "Invalid/unsupported P-code file format",
            "File is for a newer version of the AMX",
            "File or function is not found",
            "Invalid index parameter (bad entry point)",
            "Debugger cannot run",
            "AMX not initialized (or doubly initialized)",
            "Unable to set user data field (table full)",
            "Cannot initialize the JIT",
            "Parameter error",
            "Domain error, expression result does not fit in range",
            "General error (unknown or unspecific error)",
        ];
        usize::try_from(self.0)
            .ok()
            .and_then(|index| MESSAGES.get(index).copied())
            .unwrap_or("(unknown)")
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reconstructed script-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFrame {
    pub frame_address: Cell,
    /// Address of the instruction executing in this frame.
    pub code_address: Cell,
    /// Where this frame returns to; zero for a public entry frame.
    pub return_address: Cell,
    /// Entry address of the function owning `code_address`.
    pub entry_address: Option<Cell>,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<i32>,
    pub is_public: bool,
}

/// A reconstructed native-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFrame {
    pub ip: u64,
    pub fp: u64,
    pub module_path: Option<String>,
    pub symbol: Option<String>,
    pub symbol_offset: Option<u64>,
}

/// Why a stack walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// Reached the terminal frame of the chain.
    Complete,
    /// Stopped at the configured frame bound.
    DepthLimit,
    /// A frame link pointed somewhere it could not, so the rest is unknown.
    Corrupted { address: u64 },
}

impl WalkEnd {
    pub fn is_complete(self) -> bool {
        self == Self::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_follow_the_code_table() {
        assert_eq!(ErrorCode::BOUNDS.message(), "Array index out of bounds");
        assert_eq!(ErrorCode::SLEEP.message(), "(sleep mode)");
        assert_eq!(
            ErrorCode::GENERAL.message(),
            "General error (unknown or unspecific error)"
        );
        assert_eq!(ErrorCode::from_raw(-3).message(), "(unknown)");
        assert_eq!(ErrorCode::from_raw(99).message(), "(unknown)");
    }

    #[test]
    fn vm_id_rejects_zero() {
        assert_eq!(VmId::new(0), Err(InvariantError::ZeroId("vm_id")));
        assert_eq!(VmId::new(0x1000).map(VmId::get), Ok(0x1000));
    }

    #[test]
    fn call_record_constructors_tag_the_kind() {
        let vm = VmId::new(1).unwrap();
        let native = CallRecord::native(vm, 3);
        assert!(native.is_native());
        assert_eq!((native.frm, native.cip), (0, 0));

        let script = CallRecord::script(vm, -1, 0x40, 0x88);
        assert!(script.is_script());
        assert_eq!((script.frm, script.cip), (0x40, 0x88));
    }
}

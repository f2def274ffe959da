//! In-memory guest VM and recording sink shared by the unit tests.
//!
//! `nested_bounds` models `OnGameModeInit -> Inner -> CallLocalFunction ->
//! Callback`, with `Callback` failing a bounds check on index -1:
//!
//! ```text
//! code  0x08 OnGameModeInit   0x30 return from Inner
//!       0x40 Inner            0x50 sysreq.c 0 (CallLocalFunction), resumes at 0x58
//!       0x70 Callback         0x80 bounds 10
//! data  0xF40 OnGameModeInit frame, 0xF00 Inner frame, 0xE00 Callback frame
//! ```

use crate::sink::LineSink;
use crate::vm::{GuestVm, NativeEntry, PublicEntry, Registers};
use faultline_debuginfo::{DebugSymbolTable, FileEntry, LineEntry, Symbol};
use faultline_types::{Cell, ErrorCode, VmId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub struct FakeVm {
    pub id: VmId,
    pub registers: Mutex<Registers>,
    pub code: HashMap<Cell, Cell>,
    pub data: HashMap<Cell, Cell>,
    pub natives: Vec<(&'static str, u64)>,
    pub publics: Vec<(&'static str, Cell)>,
    /// What the error callback answers; `None` means the module has none.
    pub suppress: Option<bool>,
    /// Register state the error callback leaves behind, if it changes any.
    pub callback_registers: Option<Registers>,
    pub callback_calls: Mutex<Vec<ErrorCode>>,
}

impl FakeVm {
    pub fn nested_bounds() -> Self {
        Self {
            id: VmId::new(0x51).unwrap(),
            registers: Mutex::new(Registers {
                cip: 0x80,
                frm: 0xE00,
                stk: 0xDF0,
                hea: 0x400,
                stp: 0x1000,
                hlw: 0x200,
                pri: -1,
            }),
            code: HashMap::from([(0x50, 123), (0x54, 0), (0x80, 121), (0x84, 10), (0x90, 0xFF)]),
            data: HashMap::from([
                (0xE00, 0xF00),
                (0xE04, 0),
                (0xF00, 0xF40),
                (0xF04, 0x30),
                (0xF40, 0),
                (0xF44, 0),
            ]),
            natives: vec![
                ("CallLocalFunction", 0x1000),
                ("printf", 0x2000),
                ("MissingNative", 0),
            ],
            publics: vec![("OnGameModeInit", 0x08), ("Callback", 0x70)],
            suppress: None,
            callback_registers: None,
            callback_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_error_callback(mut self, suppress: bool) -> Self {
        self.suppress = Some(suppress);
        self.publics.push(("OnRuntimeError", 0xA0));
        self
    }

    pub fn poke(&mut self, address: Cell, value: Cell) {
        self.data.insert(address, value);
    }

    pub fn set_registers(&self, cip: Cell, frm: Cell) {
        let mut registers = self.registers.lock();
        registers.cip = cip;
        registers.frm = frm;
    }
}

impl GuestVm for FakeVm {
    fn id(&self) -> VmId {
        self.id
    }

    fn registers(&self) -> Registers {
        *self.registers.lock()
    }

    fn read_code(&self, address: Cell) -> Option<Cell> {
        (0..0x100).contains(&address).then(|| self.code.get(&address).copied().unwrap_or(0))
    }

    fn read_data(&self, address: Cell) -> Option<Cell> {
        (0..0x1000).contains(&address).then(|| self.data.get(&address).copied().unwrap_or(0))
    }

    fn native_count(&self) -> usize {
        self.natives.len()
    }

    fn native(&self, index: Cell) -> Option<NativeEntry<'_>> {
        let (name, address) = *self.natives.get(usize::try_from(index).ok()?)?;
        Some(NativeEntry { name, address })
    }

    fn public(&self, index: Cell) -> Option<PublicEntry<'_>> {
        let (name, address) = *self.publics.get(usize::try_from(index).ok()?)?;
        Some(PublicEntry { name, address })
    }

    fn find_public(&self, name: &str) -> Option<Cell> {
        self.publics
            .iter()
            .position(|(public, _)| *public == name)
            .and_then(|index| Cell::try_from(index).ok())
    }

    fn call_error_callback(&self, _index: Cell, code: ErrorCode) -> Option<bool> {
        self.callback_calls.lock().push(code);
        if let Some(registers) = self.callback_registers {
            *self.registers.lock() = registers;
        }
        self.suppress
    }
}

fn function(name: &str, start: u32, end: u32) -> Symbol {
    Symbol {
        address: start,
        tag: 0,
        code_start: start,
        code_end: end,
        ident: 9,
        vclass: 0,
        name: name.to_owned(),
        dims: Vec::new(),
    }
}

pub fn debug_table() -> DebugSymbolTable {
    DebugSymbolTable::from_parts(
        vec![FileEntry {
            address: 0,
            name: "test.pwn".to_owned(),
        }],
        [(0x08, 0), (0x30, 2), (0x40, 3), (0x58, 4), (0x70, 7), (0x80, 9)]
            .into_iter()
            .map(|(address, line)| LineEntry { address, line })
            .collect(),
        vec![
            function("OnGameModeInit", 0x08, 0x40),
            function("Inner", 0x40, 0x70),
            function("Callback", 0x70, 0xA0),
        ],
        Vec::new(),
    )
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }
}

impl LineSink for RecordingSink {
    fn line(&self, line: &str) {
        self.lines.lock().push(line.to_owned());
    }
}

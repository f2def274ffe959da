//! The seam between the reporter and the embedded VM.
//!
//! Everything the reporter knows about a guest VM comes through [`GuestVm`]:
//! registers, bounds-checked reads of code and data memory, the native and
//! public tables, and a way to run the module's error-notification public.

use faultline_types::{Cell, ErrorCode, VmId};

/// Register file snapshot. All values are byte addresses relative to the
/// VM's own code or data section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub cip: Cell,
    pub frm: Cell,
    pub stk: Cell,
    pub hea: Cell,
    pub stp: Cell,
    pub hlw: Cell,
    pub pri: Cell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeEntry<'a> {
    pub name: &'a str,
    /// Host address of the implementation; zero while unresolved.
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicEntry<'a> {
    pub name: &'a str,
    pub address: Cell,
}

/// The few instructions the reporter decodes to explain a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    Bounds = 121,
    SysreqC = 123,
}

pub trait GuestVm: Send + Sync {
    fn id(&self) -> VmId;

    fn registers(&self) -> Registers;

    /// Reads one code cell; `None` outside the code section.
    fn read_code(&self, address: Cell) -> Option<Cell>;

    /// Reads one data cell; `None` outside the data section.
    fn read_data(&self, address: Cell) -> Option<Cell>;

    fn native_count(&self) -> usize;

    fn native(&self, index: Cell) -> Option<NativeEntry<'_>>;

    fn public(&self, index: Cell) -> Option<PublicEntry<'_>>;

    fn find_public(&self, name: &str) -> Option<Cell>;

    /// Runs public `index` as `callback(code, &suppress)` and returns the
    /// suppress flag, or `None` if the call itself failed.
    fn call_error_callback(&self, index: Cell, code: ErrorCode) -> Option<bool>;

    /// Opcode value as it appears in loaded code. VMs that relocate opcodes
    /// to handler addresses override this.
    fn opcode(&self, opcode: Opcode) -> Cell {
        opcode as Cell
    }
}

/// Iterates the native table.
pub fn natives(vm: &dyn GuestVm) -> impl Iterator<Item = NativeEntry<'_>> {
    (0..vm.native_count()).filter_map(move |index| {
        Cell::try_from(index)
            .ok()
            .and_then(|index| vm.native(index))
    })
}

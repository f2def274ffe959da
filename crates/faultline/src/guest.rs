//! Guest (script-level) stack walking.
//!
//! A guest frame stores the caller's frame pointer at `[frm]` and the return
//! address at `[frm + cell]`. A public entry frame has return address zero,
//! which is where one script segment of the chain ends.

use crate::vm::{GuestVm, PublicEntry};
use faultline_debuginfo::DebugSymbolTable;
use faultline_types::{CELL_SIZE, Cell, GuestFrame, WalkEnd};

/// Where a walk starts: the instruction and frame pointers of the innermost frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestCursor {
    pub cip: Cell,
    pub frm: Cell,
}

/// A frame as seen during the walk; names borrow the debug table or the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestFrameRef<'a> {
    pub frame_address: Cell,
    pub code_address: Cell,
    pub return_address: Cell,
    pub entry_address: Option<Cell>,
    pub function: Option<&'a str>,
    pub file: Option<&'a str>,
    pub line: Option<i32>,
    pub is_public: bool,
}

impl GuestFrameRef<'_> {
    pub fn to_owned_frame(&self) -> GuestFrame {
        GuestFrame {
            frame_address: self.frame_address,
            code_address: self.code_address,
            return_address: self.return_address,
            entry_address: self.entry_address,
            function: self.function.map(str::to_owned),
            file: self.file.map(str::to_owned),
            line: self.line,
            is_public: self.is_public,
        }
    }
}

/// The public a script segment was entered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEntry<'a> {
    pub name: Option<&'a str>,
    pub address: Cell,
}

impl<'a> From<PublicEntry<'a>> for SegmentEntry<'a> {
    fn from(entry: PublicEntry<'a>) -> Self {
        Self {
            name: Some(entry.name),
            address: entry.address,
        }
    }
}

fn resolve<'a>(
    debug: &'a DebugSymbolTable,
    frame_address: Cell,
    code_address: Cell,
    return_address: Cell,
    is_public: bool,
    entry: Option<SegmentEntry<'a>>,
) -> GuestFrameRef<'a> {
    let lookup = u32::try_from(code_address).ok();
    let symbol = lookup.and_then(|address| debug.function_at(address));
    let mut function = symbol.map(|symbol| symbol.name.as_str());
    let mut entry_address = symbol.and_then(|symbol| Cell::try_from(symbol.address).ok());
    if is_public {
        if let Some(entry) = entry {
            entry_address = Some(entry.address);
            function = function.or(entry.name);
        }
    }
    GuestFrameRef {
        frame_address,
        code_address,
        return_address,
        entry_address,
        function,
        file: lookup.and_then(|address| debug.file_name_at(address)),
        line: lookup.and_then(|address| debug.line_number_at(address)),
        is_public,
    }
}

/// Walks one script segment from `cursor` to its public entry frame,
/// innermost first.
///
/// `entry` names the public this segment was entered through. When
/// `cursor.cip` is zero control has just crossed into the script and no
/// frame exists yet; a single synthetic frame at the entry address is
/// produced instead.
pub fn walk_segment<'a, F>(
    vm: &dyn GuestVm,
    debug: &'a DebugSymbolTable,
    cursor: GuestCursor,
    entry: Option<SegmentEntry<'a>>,
    max_frames: usize,
    mut visit: F,
) -> WalkEnd
where
    F: FnMut(GuestFrameRef<'a>),
{
    if max_frames == 0 {
        return WalkEnd::DepthLimit;
    }
    if cursor.cip == 0 {
        if let Some(entry) = entry {
            visit(resolve(debug, cursor.frm, entry.address, 0, true, Some(entry)));
        }
        return WalkEnd::Complete;
    }

    let mut cip = cursor.cip;
    let mut frm = cursor.frm;
    let mut emitted = 0usize;
    loop {
        if emitted == max_frames {
            return WalkEnd::DepthLimit;
        }
        if frm == 0 {
            visit(resolve(debug, frm, cip, 0, true, entry));
            return WalkEnd::Complete;
        }
        let link = vm
            .read_data(frm)
            .zip(frm.checked_add(CELL_SIZE).and_then(|at| vm.read_data(at)));
        let Some((caller_frm, return_address)) = link else {
            visit(resolve(debug, frm, cip, 0, false, None));
            return WalkEnd::Corrupted {
                address: frm as u32 as u64,
            };
        };

        let outermost = return_address == 0 || caller_frm == 0;
        visit(resolve(debug, frm, cip, return_address, outermost, entry));
        emitted += 1;

        if outermost {
            return WalkEnd::Complete;
        }
        if caller_frm <= frm {
            return WalkEnd::Corrupted {
                address: caller_frm as u32 as u64,
            };
        }
        cip = return_address;
        frm = caller_frm;
    }
}

/// Owned variant of [`walk_segment`].
pub fn collect_segment(
    vm: &dyn GuestVm,
    debug: &DebugSymbolTable,
    cursor: GuestCursor,
    entry: Option<SegmentEntry<'_>>,
    max_frames: usize,
) -> (Vec<GuestFrame>, WalkEnd) {
    let mut frames = Vec::new();
    let end = walk_segment(vm, debug, cursor, entry, max_frames, |frame| {
        frames.push(frame.to_owned_frame())
    });
    (frames, end)
}

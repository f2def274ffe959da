//! Relative-jump detours.
//!
//! A detour overwrites the first five bytes at a code address with
//! `E9 <rel32>`, a near jump to an interceptor. The bytes it replaced are kept
//! so removal restores the original code exactly. All memory access goes
//! through [`CodeMemory`]; [`ProcessMemory`] is the live implementation.

use std::error::Error;
use std::fmt;
use tracing::debug;

/// Size of an `E9 rel32` instruction.
pub const JUMP_SIZE: usize = 5;

const JUMP_OPCODE: u8 = 0xE9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetourError {
    AlreadyInstalled { src: usize },
    NotInstalled,
    DisplacementOutOfRange { src: usize, dst: usize },
    Protect { address: usize, errno: i32 },
    OutOfBounds { address: usize, len: usize },
}

impl fmt::Display for DetourError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInstalled { src } => {
                write!(f, "a detour is already installed at 0x{src:x}")
            }
            Self::NotInstalled => write!(f, "detour is not installed"),
            Self::DisplacementOutOfRange { src, dst } => write!(
                f,
                "jump from 0x{src:x} to 0x{dst:x} does not fit a 32-bit displacement"
            ),
            Self::Protect { address, errno } => write!(
                f,
                "failed to make code at 0x{address:x} writable (errno {errno})"
            ),
            Self::OutOfBounds { address, len } => {
                write!(f, "{len} bytes at 0x{address:x} are outside the code region")
            }
        }
    }
}

impl Error for DetourError {}

/// Platform seam over executable memory.
pub trait CodeMemory {
    /// Makes `len` bytes at `address` writable (and still executable).
    fn unprotect(&mut self, address: usize, len: usize) -> Result<(), DetourError>;
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), DetourError>;
    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<(), DetourError>;
}

/// Patches the code of the running process.
#[derive(Debug, Default)]
pub struct ProcessMemory {
    _private: (),
}

impl ProcessMemory {
    /// # Safety
    ///
    /// Every address later passed to this handle must point into mapped code
    /// of this process that no other thread executes while it is patched.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl CodeMemory for ProcessMemory {
    fn unprotect(&mut self, address: usize, len: usize) -> Result<(), DetourError> {
        platform::unprotect(address, len)
    }

    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), DetourError> {
        if address == 0 {
            return Err(DetourError::OutOfBounds {
                address,
                len: buf.len(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<(), DetourError> {
        if address == 0 {
            return Err(DetourError::OutOfBounds {
                address,
                len: bytes.len(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        Ok(())
    }
}

/// Encodes `E9 rel32` jumping from `src` to `dst`.
pub fn encode_jump(src: usize, dst: usize) -> Result<[u8; JUMP_SIZE], DetourError> {
    let next = (src as i128) + JUMP_SIZE as i128;
    let displacement = i32::try_from(dst as i128 - next)
        .map_err(|_| DetourError::DisplacementOutOfRange { src, dst })?;
    let mut code = [0u8; JUMP_SIZE];
    code[0] = JUMP_OPCODE;
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    Ok(code)
}

/// Decodes the destination of a jump instruction at `at`, if it is one.
pub fn decode_jump(at: usize, code: &[u8; JUMP_SIZE]) -> Option<usize> {
    if code[0] != JUMP_OPCODE {
        return None;
    }
    let mut rel = [0u8; 4];
    rel.copy_from_slice(&code[1..]);
    let displacement = i32::from_le_bytes(rel) as i128;
    let target = at as i128 + JUMP_SIZE as i128 + displacement;
    usize::try_from(target).ok()
}

/// Reads `at` and returns where the jump found there leads, so a new detour can
/// forward to whatever another agent installed earlier.
pub fn target_address<M: CodeMemory + ?Sized>(memory: &M, at: usize) -> Option<usize> {
    let mut code = [0u8; JUMP_SIZE];
    memory.read(at, &mut code).ok()?;
    decode_jump(at, &code)
}

/// One redirect at one source address.
#[derive(Debug, Default)]
pub struct Detour {
    src: usize,
    dst: usize,
    original: [u8; JUMP_SIZE],
    installed: bool,
}

impl Detour {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install<M: CodeMemory + ?Sized>(
        &mut self,
        memory: &mut M,
        src: usize,
        dst: usize,
    ) -> Result<(), DetourError> {
        if self.installed {
            return Err(DetourError::AlreadyInstalled { src: self.src });
        }

        let jump = encode_jump(src, dst)?;
        memory.unprotect(src, JUMP_SIZE)?;
        let mut original = [0u8; JUMP_SIZE];
        memory.read(src, &mut original)?;
        memory.write(src, &jump)?;

        debug!(src = format_args!("0x{src:x}"), dst = format_args!("0x{dst:x}"), "detour installed");
        self.src = src;
        self.dst = dst;
        self.original = original;
        self.installed = true;
        Ok(())
    }

    pub fn remove<M: CodeMemory + ?Sized>(&mut self, memory: &mut M) -> Result<(), DetourError> {
        if !self.installed {
            return Err(DetourError::NotInstalled);
        }
        memory.write(self.src, &self.original)?;
        debug!(src = format_args!("0x{:x}", self.src), "detour removed");
        self.installed = false;
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn source(&self) -> usize {
        self.src
    }

    pub fn destination(&self) -> usize {
        self.dst
    }

    /// Bytes the jump replaced; only meaningful while installed.
    pub fn original_bytes(&self) -> &[u8; JUMP_SIZE] {
        &self.original
    }
}

#[cfg(unix)]
mod platform {
    use super::DetourError;

    pub fn unprotect(address: usize, len: usize) -> Result<(), DetourError> {
        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as usize,
            _ => 4096,
        };
        let start = address & !(page_size - 1);
        let end = address
            .checked_add(len)
            .ok_or(DetourError::OutOfBounds { address, len })?;
        let span = end - start;
        let rc = unsafe {
            libc::mprotect(
                start as *mut libc::c_void,
                span,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(DetourError::Protect { address, errno });
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod platform {
    use super::DetourError;

    pub fn unprotect(address: usize, _len: usize) -> Result<(), DetourError> {
        Err(DetourError::Protect { address, errno: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A code region at a fixed base address that counts writes.
    struct Region {
        base: usize,
        bytes: Vec<u8>,
        writes: usize,
        unprotected: Vec<(usize, usize)>,
    }

    impl Region {
        fn new(base: usize, len: usize) -> Self {
            Self {
                base,
                bytes: (0..len).map(|i| (i % 251) as u8).collect(),
                writes: 0,
                unprotected: Vec::new(),
            }
        }

        fn range(&self, address: usize, len: usize) -> Result<std::ops::Range<usize>, DetourError> {
            let start = address
                .checked_sub(self.base)
                .ok_or(DetourError::OutOfBounds { address, len })?;
            let end = start + len;
            if end > self.bytes.len() {
                return Err(DetourError::OutOfBounds { address, len });
            }
            Ok(start..end)
        }
    }

    impl CodeMemory for Region {
        fn unprotect(&mut self, address: usize, len: usize) -> Result<(), DetourError> {
            self.range(address, len)?;
            self.unprotected.push((address, len));
            Ok(())
        }

        fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), DetourError> {
            let range = self.range(address, buf.len())?;
            buf.copy_from_slice(&self.bytes[range]);
            Ok(())
        }

        fn write(&mut self, address: usize, bytes: &[u8]) -> Result<(), DetourError> {
            let range = self.range(address, bytes.len())?;
            self.bytes[range].copy_from_slice(bytes);
            self.writes += 1;
            Ok(())
        }
    }

    #[test]
    fn install_writes_relative_jump() {
        let mut region = Region::new(0x40_0000, 0x100);
        let mut detour = Detour::new();
        detour.install(&mut region, 0x40_0010, 0x40_0080).unwrap();

        // 0x400080 - (0x400010 + 5) = 0x6b
        assert_eq!(&region.bytes[0x10..0x15], &[0xE9, 0x6B, 0x00, 0x00, 0x00]);
        assert_eq!(region.unprotected, vec![(0x40_0010, JUMP_SIZE)]);
        assert!(detour.is_installed());
        assert_eq!(detour.source(), 0x40_0010);
        assert_eq!(detour.destination(), 0x40_0080);
    }

    #[test]
    fn backward_jump_has_negative_displacement() {
        let mut region = Region::new(0x40_0000, 0x100);
        let mut detour = Detour::new();
        detour.install(&mut region, 0x40_0080, 0x40_0000).unwrap();
        let displacement = i32::from_le_bytes(region.bytes[0x81..0x85].try_into().unwrap());
        assert_eq!(displacement, -0x85);
        assert_eq!(target_address(&region, 0x40_0080), Some(0x40_0000));
    }

    #[test]
    fn remove_restores_original_bytes() {
        let mut region = Region::new(0x40_0000, 0x100);
        let before = region.bytes.clone();
        let mut detour = Detour::new();
        detour.install(&mut region, 0x40_0020, 0x40_00F0).unwrap();
        assert_ne!(region.bytes, before);

        detour.remove(&mut region).unwrap();
        assert_eq!(region.bytes, before);
        assert!(!detour.is_installed());
    }

    #[test]
    fn second_install_fails_without_touching_memory() {
        let mut region = Region::new(0x40_0000, 0x100);
        let mut detour = Detour::new();
        detour.install(&mut region, 0x40_0020, 0x40_00F0).unwrap();
        let patched = region.bytes.clone();
        let writes = region.writes;

        let err = detour.install(&mut region, 0x40_0030, 0x40_00F0).unwrap_err();
        assert_eq!(err, DetourError::AlreadyInstalled { src: 0x40_0020 });
        assert_eq!(region.bytes, patched);
        assert_eq!(region.writes, writes);
        assert_eq!(region.unprotected.len(), 1);
    }

    #[test]
    fn remove_without_install_fails() {
        let mut region = Region::new(0x40_0000, 0x10);
        let mut detour = Detour::new();
        assert_eq!(detour.remove(&mut region), Err(DetourError::NotInstalled));
        assert_eq!(region.writes, 0);
    }

    #[test]
    fn reinstall_after_remove_is_allowed() {
        let mut region = Region::new(0x40_0000, 0x100);
        let before = region.bytes.clone();
        let mut detour = Detour::new();
        detour.install(&mut region, 0x40_0020, 0x40_00F0).unwrap();
        detour.remove(&mut region).unwrap();
        detour.install(&mut region, 0x40_0020, 0x40_0010).unwrap();
        assert_eq!(target_address(&region, 0x40_0020), Some(0x40_0010));
        detour.remove(&mut region).unwrap();
        assert_eq!(region.bytes, before);
    }

    #[test]
    fn target_address_ignores_non_jumps() {
        let region = Region::new(0x40_0000, 0x10);
        assert_eq!(region.bytes[0], 0x00);
        assert_eq!(target_address(&region, 0x40_0000), None);
        assert_eq!(target_address(&region, 0x50_0000), None);
    }

    #[test]
    fn chained_detour_forwards_to_previous_target() {
        let mut region = Region::new(0x40_0000, 0x100);
        let mut first = Detour::new();
        first.install(&mut region, 0x40_0000, 0x40_0080).unwrap();

        let previous = target_address(&region, 0x40_0000).unwrap();
        assert_eq!(previous, 0x40_0080);

        let mut forward = Detour::new();
        forward.install(&mut region, 0x40_00C0, previous).unwrap();
        assert_eq!(target_address(&region, 0x40_00C0), Some(0x40_0080));
    }

    #[test]
    fn far_jump_is_rejected() {
        let mut region = Region::new(0x40_0000, 0x10);
        let mut detour = Detour::new();
        let far = 0x40_0000usize.wrapping_add(1usize << 40);
        if far > 0x40_0000 {
            assert!(matches!(
                detour.install(&mut region, 0x40_0000, far),
                Err(DetourError::DisplacementOutOfRange { .. })
            ));
            assert_eq!(region.writes, 0);
        }
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn process_memory_patches_a_mapped_page() {
        unsafe {
            let page = libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(page, libc::MAP_FAILED);
            let src = page as usize + 0x10;

            let mut memory = ProcessMemory::new();
            let mut detour = Detour::new();
            detour.install(&mut memory, src, src + 0x100).unwrap();
            assert_eq!(target_address(&memory, src), Some(src + 0x100));
            detour.remove(&mut memory).unwrap();
            assert_eq!(target_address(&memory, src), None);

            libc::munmap(page, 4096);
        }
    }
}

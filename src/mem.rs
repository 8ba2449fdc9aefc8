#[allow(unused_imports)]
use tracing::{trace, debug, error, warn, info};

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ADDRESS_MASK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryErrorKind {
    InvalidRead,
    InvalidWrite,
}

/// Structured record of a guest access that missed every window. Only raised
/// when the debugging feature is compiled in; production builds absorb the
/// access instead.
#[derive(Debug, Clone, Copy)]
pub struct MemoryError {
    pub kind   : MemoryErrorKind,
    pub pc     : u32,
    pub address: u32,
    pub width  : u32,
    pub value  : u32,
}

/// Geometry of the guest physical space. The framebuffer shadow mask
/// collapses the hardware's address aliases before the bound test; the value
/// below mirrors the real part and is kept configurable rather than derived.
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    pub main_base: u32,
    pub main_size: u32,

    pub framebuffer_base: u32,
    pub framebuffer_size: u32,
    pub framebuffer_shadow_mask: u32,

    pub scratchpad_base: u32,
    pub scratchpad_size: u32,
}

impl Default for MemoryConfig {
    fn default() -> MemoryConfig {
        MemoryConfig {
            main_base: 0x0800_0000,
            main_size: 32 * 1024 * 1024,
            framebuffer_base: 0x0400_0000,
            framebuffer_size: 2 * 1024 * 1024,
            framebuffer_shadow_mask: 0x041F_FFFF,
            scratchpad_base: 0x0001_0000,
            scratchpad_size: 16 * 1024,
        }
    }
}

/// One contiguous guest physical range backed by a host buffer. `bound` is
/// inclusive. Lookup walks the window table in order, so earlier windows
/// take priority.
#[derive(Debug, Clone, Copy)]
pub struct MemoryWindow {
    pub base: u32,
    pub bound: u32,
    pub shadow_mask: Option<u32>,
    pub host: *mut u8,
    pub len: usize,
}

/// Find the window an address falls in and the offset into it. The same
/// ordered table drives both this host-side path and the range checks baked
/// into generated code.
pub(crate) fn translate_windows(windows: &[MemoryWindow], address: u32) -> Option<(usize, usize)> {
    let address = address & ADDRESS_MASK;
    for (index, window) in windows.iter().enumerate() {
        if address < window.base {
            continue;
        }
        let masked = match window.shadow_mask {
            Some(mask) => address & mask,
            None => address,
        };
        if masked < window.base || masked > window.bound {
            continue;
        }
        return Some((index, (masked - window.base) as usize));
    }
    None
}

pub struct Memory {
    config: MemoryConfig,
    buffers: Vec<Vec<u8>>,
    windows: Vec<MemoryWindow>,
}

impl Memory {
    pub fn new(config: MemoryConfig) -> Memory {
        let mut buffers = Vec::new();
        let mut windows = Vec::new();

        fn add_window(buffers: &mut Vec<Vec<u8>>, windows: &mut Vec<MemoryWindow>,
                      base: u32, size: u32, shadow_mask: Option<u32>) {
            assert!(size >= 4 && (size & 3) == 0);
            let bound = base + size - 1;
            assert!(bound <= ADDRESS_MASK, "window ${:08X}..${:08X} exceeds guest space", base, bound);

            // generated code always loads a full word, so word reads at the
            // last byte of a window have to stay inside the host buffer
            let mut buffer = vec![0u8; (size as usize) + 4];
            let host = buffer.as_mut_ptr();
            buffers.push(buffer);

            windows.push(MemoryWindow {
                base: base,
                bound: bound,
                shadow_mask: shadow_mask,
                host: host,
                len: size as usize,
            });
        }

        // lookup priority: main memory, framebuffer, scratchpad
        add_window(&mut buffers, &mut windows, config.main_base, config.main_size, None);
        add_window(&mut buffers, &mut windows, config.framebuffer_base, config.framebuffer_size,
                   Some(config.framebuffer_shadow_mask));
        #[cfg(feature = "scratchpad")]
        add_window(&mut buffers, &mut windows, config.scratchpad_base, config.scratchpad_size, None);

        // windows must not overlap in guest space
        for (i, a) in windows.iter().enumerate() {
            for b in windows.iter().skip(i + 1) {
                assert!(a.bound < b.base || b.bound < a.base,
                        "memory windows ${:08X} and ${:08X} overlap", a.base, b.base);
            }
        }

        Memory {
            config: config,
            buffers: buffers,
            windows: windows,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn windows(&self) -> &[MemoryWindow] {
        &self.windows
    }

    pub fn translate(&self, address: u32) -> Option<(usize, usize)> {
        translate_windows(&self.windows, address)
    }

    fn read(&self, address: u32, width: u32) -> Result<u32, MemoryError> {
        match self.translate(address) {
            Some((index, offset)) => {
                let buffer = &self.buffers[index];
                let value = match width {
                    1 => buffer[offset] as u32,
                    2 => u16::from_le_bytes([buffer[offset], buffer[offset + 1]]) as u32,
                    4 => u32::from_le_bytes([buffer[offset], buffer[offset + 1],
                                             buffer[offset + 2], buffer[offset + 3]]),
                    _ => panic!("bad access width {}", width),
                };
                Ok(value)
            },
            None => Err(MemoryError {
                kind: MemoryErrorKind::InvalidRead,
                pc: 0,
                address: address,
                width: width,
                value: 0,
            }),
        }
    }

    fn write(&mut self, value: u32, address: u32, width: u32) -> Result<(), MemoryError> {
        match self.translate(address) {
            Some((index, offset)) => {
                let buffer = &mut self.buffers[index];
                match width {
                    1 => buffer[offset] = value as u8,
                    2 => buffer[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes()),
                    4 => buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
                    _ => panic!("bad access width {}", width),
                };
                Ok(())
            },
            None => Err(MemoryError {
                kind: MemoryErrorKind::InvalidWrite,
                pc: 0,
                address: address,
                width: width,
                value: value,
            }),
        }
    }

    pub fn read_u8(&self, address: u32) -> Result<u8, MemoryError> {
        Ok(self.read(address, 1)? as u8)
    }

    pub fn read_u16(&self, address: u32) -> Result<u16, MemoryError> {
        Ok(self.read(address, 2)? as u16)
    }

    pub fn read_u32(&self, address: u32) -> Result<u32, MemoryError> {
        self.read(address, 4)
    }

    pub fn write_u8(&mut self, value: u8, address: u32) -> Result<(), MemoryError> {
        self.write(value as u32, address, 1)
    }

    pub fn write_u16(&mut self, value: u16, address: u32) -> Result<(), MemoryError> {
        self.write(value as u32, address, 2)
    }

    pub fn write_u32(&mut self, value: u32, address: u32) -> Result<(), MemoryError> {
        self.write(value, address, 4)
    }

    /// Copy a byte image into one window, e.g. a program loaded at the main
    /// memory base.
    pub fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), MemoryError> {
        let (index, offset) = self.translate(address).ok_or(MemoryError {
            kind: MemoryErrorKind::InvalidWrite,
            pc: 0,
            address: address,
            width: 4,
            value: 0,
        })?;

        let window_len = self.windows[index].len;
        if offset + data.len() > window_len {
            return Err(MemoryError {
                kind: MemoryErrorKind::InvalidWrite,
                pc: 0,
                address: address,
                width: 4,
                value: 0,
            });
        }

        self.buffers[index][offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// What to do after a recorded memory fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPolicy {
    /// absorb the fault and keep the guest running
    Continue,
    /// request a stop; the driver observes it at the next trap exit, since
    /// generated code is never unwound
    Halt,
}

/// Sink for structured memory faults raised by generated code under the
/// debugging feature. Injected into the generation context so the emitted
/// fallback path can reach it without hidden globals.
pub struct Diagnostics {
    policy: FaultPolicy,
    faults: Mutex<Vec<MemoryError>>,
    halt_requested: AtomicBool,
}

impl Diagnostics {
    pub fn new(policy: FaultPolicy) -> Diagnostics {
        Diagnostics {
            policy: policy,
            faults: Mutex::new(Vec::new()),
            halt_requested: AtomicBool::new(false),
        }
    }

    pub fn record(&self, fault: MemoryError) {
        error!(target: "MEM", "{:?} at pc=${:08X} address=${:08X} width={}",
               fault.kind, fault.pc, fault.address, fault.width);

        self.faults.lock().unwrap().push(fault);
        if self.policy == FaultPolicy::Halt {
            self.halt_requested.store(true, Ordering::SeqCst);
        }
    }

    pub fn halt_requested(&self) -> bool {
        self.halt_requested.load(Ordering::SeqCst)
    }

    pub fn take_faults(&self) -> Vec<MemoryError> {
        std::mem::take(&mut *self.faults.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_masks_reserved_bits() {
        let memory = Memory::new(MemoryConfig::default());
        let address = 0x0800_1234;
        // the top two bits are cache-control noise and never affect mapping
        assert_eq!(memory.translate(address), memory.translate(address | 0x4000_0000));
        assert_eq!(memory.translate(address), memory.translate(address | 0xC000_0000));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let config = MemoryConfig::default();
        let memory = Memory::new(config);

        let base = config.main_base;
        let bound = config.main_base + config.main_size - 1;
        assert_eq!(memory.translate(base), Some((0, 0)));
        assert_eq!(memory.translate(bound), Some((0, (config.main_size - 1) as usize)));
        // one past the bound falls through to the next window or the fallback
        assert!(memory.translate(bound + 1).map_or(true, |(index, _)| index != 0));
    }

    #[test]
    fn framebuffer_shadow_aliases_collapse() {
        let config = MemoryConfig::default();
        let mut memory = Memory::new(config);

        memory.write_u32(0x1234_5678, 0x0400_0120).unwrap();
        // the alias differs only in bits stripped by the shadow mask
        assert_eq!(memory.read_u32(0x0420_0120).unwrap(), 0x1234_5678);
        assert_eq!(memory.translate(0x0420_0120), memory.translate(0x0400_0120));
    }

    #[test]
    fn unmapped_accesses_error() {
        let mut memory = Memory::new(MemoryConfig::default());
        assert_eq!(memory.read_u32(0x00F0_0000).unwrap_err().kind, MemoryErrorKind::InvalidRead);
        assert_eq!(memory.write_u32(0, 0x00F0_0000).unwrap_err().kind, MemoryErrorKind::InvalidWrite);
    }

    #[test]
    #[should_panic]
    fn overlapping_windows_are_rejected() {
        let mut config = MemoryConfig::default();
        config.framebuffer_base = config.main_base + 0x1000;
        config.framebuffer_shadow_mask = 0xFFFF_FFFF;
        Memory::new(config);
    }

    #[test]
    fn diagnostics_record_and_halt() {
        let diagnostics = Diagnostics::new(FaultPolicy::Halt);
        diagnostics.record(MemoryError {
            kind: MemoryErrorKind::InvalidRead,
            pc: 0x0800_0004,
            address: 0x0123_4567,
            width: 4,
            value: 0,
        });
        assert!(diagnostics.halt_requested());
        assert_eq!(diagnostics.take_faults().len(), 1);
    }
}

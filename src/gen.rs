//! Generation context and the memory-access emission helpers shared by the
//! per-opcode generators.
//!
//! Generated code runs under an internal calling convention:
//!  - at every block entry `[rsp]` holds the return address into the bounce
//!    trampoline and `[rsp + 8]` is the reserved slot with the guest context
//!    pointer; `rsp % 16 == 8`, and nothing in a block moves `rsp` across
//!    instruction boundaries
//!  - each block reloads `rbp` from the reserved slot in its prologue and
//!    addresses guest state as `[rbp + offset]`
//!  - `eax` carries the guest address and load results, `ebx` store data and
//!    merge masks, `ecx`/`edx` are scratch, `r10`/`r11` address window
//!    buffers; everything else is preserved by the bounce

#[allow(unused_imports)]
use tracing::{trace, debug, error, warn, info};

use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi};
use memoffset::offset_of;

use crate::ADDRESS_MASK;
#[allow(unused_imports)]
use crate::breakpoints::{AccessDirection, MemoryBreakpoints};
use crate::builder::BlockBuilder;
use crate::cpu::CpuContext;
#[allow(unused_imports)]
use crate::mem::{Diagnostics, MemoryError, MemoryErrorKind, MemoryWindow};
use crate::thunk::SlotArena;

pub type Assembler = dynasmrt::x64::Assembler;

/// Outcome of one generator invocation. Anything other than Success ends the
/// block; Invalid aborts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenResult {
    Success,
    /// recognized but unsupported; the build must abort, not emit
    Invalid,
    /// unconditional transfer to a statically known target
    Jump { target: u32 },
    /// conditional transfer; the condition is latched before the delay slot
    Branch { target: u32 },
    /// transfer to the latched register target
    JumpRegister,
    /// leave generated code; pc resumes at the given address
    Trap { resume: u32 },
}

/// Per-build state handed to every instruction generator. Owned by exactly
/// one build; the assembler inside is consumed by finalization on all paths.
pub struct GenContext<'a> {
    pub asm: &'a mut Assembler,
    pub windows: &'a [MemoryWindow],
    pub slots: &'a mut SlotArena,
    pub thunk: *const u8,
    pub dynamic_thunk: *const u8,
    pub breakpoints: *const MemoryBreakpoints,
    pub diagnostics: *const Diagnostics,
    pub builder: *mut BlockBuilder,
}

pub(crate) fn reg_offset(register: usize) -> i32 {
    (offset_of!(CpuContext, registers) + 4 * register) as i32
}

pub(crate) fn cp1_offset(register: usize) -> i32 {
    (offset_of!(CpuContext, cp1_registers) + 4 * register) as i32
}

pub(crate) fn branch_flag_offset() -> i32 {
    offset_of!(CpuContext, branch_flag) as i32
}

pub(crate) fn jump_target_offset() -> i32 {
    offset_of!(CpuContext, jump_target) as i32
}

/// eax = rs + sign-extended immediate, masked to the significant 30 bits.
/// The add is skipped for a zero immediate.
pub(crate) fn emit_effective_address(asm: &mut Assembler, rs: usize, imm: u16) {
    dynasm!(asm
        ; .arch x64
        ; mov eax, [rbp + reg_offset(rs)]
    );
    let simm = imm as i16 as i32;
    if simm != 0 {
        dynasm!(asm
            ; .arch x64
            ; add eax, simm
        );
    }
    dynasm!(asm
        ; .arch x64
        ; and eax, ADDRESS_MASK as i32
    );
}

/// eax = word loaded from the guest address in eax. Walks the window table
/// in priority order; a miss on every window calls the out-of-line read
/// handler. ecx and edx survive, including across the handler call.
pub(crate) fn emit_memory_read(g: &mut GenContext, pc: u32) {
    #[cfg(feature = "debugging")]
    emit_breakpoint_check(g, pc, AccessDirection::Read);

    let windows = g.windows;
    let diagnostics = g.diagnostics as usize as i64;
    let handler = jit_read_fallback as usize as i64;
    let asm = &mut *g.asm;

    let done = asm.new_dynamic_label();
    for window in windows {
        let miss = asm.new_dynamic_label();
        match window.shadow_mask {
            None => dynasm!(asm
                ; .arch x64
                ; cmp eax, window.base as i32
                ; jb =>miss
                ; cmp eax, window.bound as i32
                ; ja =>miss
                ; sub eax, window.base as i32
                ; mov r11, QWORD window.host as i64
                ; mov eax, [r11 + rax]
                ; jmp =>done
            ),
            Some(mask) => dynasm!(asm
                ; .arch x64
                ; cmp eax, window.base as i32
                ; jb =>miss
                ; mov r11d, eax
                ; and r11d, mask as i32
                ; cmp r11d, window.base as i32
                ; jb =>miss
                ; cmp r11d, window.bound as i32
                ; ja =>miss
                ; sub r11d, window.base as i32
                ; mov r10, QWORD window.host as i64
                ; mov eax, [r10 + r11]
                ; jmp =>done
            ),
        }
        dynasm!(asm ; .arch x64 ; =>miss);
    }

    dynasm!(asm
        ; .arch x64
        ; push rcx
        ; push rdx
        ; mov edi, pc as i32
        ; mov esi, eax
        ; mov rdx, QWORD diagnostics
        ; mov rax, QWORD handler
        ; sub rsp, 8
        ; call rax
        ; add rsp, 8
        ; pop rdx
        ; pop rcx
        ; =>done
    );
}

/// Store the low `width` bytes of ebx at the guest address in eax. Same
/// window walk as the read path; the out-of-line write handler receives the
/// zero-extended value.
pub(crate) fn emit_memory_write(g: &mut GenContext, pc: u32, width: u32) {
    #[cfg(feature = "debugging")]
    emit_breakpoint_check(g, pc, AccessDirection::Write);

    let windows = g.windows;
    let diagnostics = g.diagnostics as usize as i64;
    let handler = jit_write_fallback as usize as i64;
    let asm = &mut *g.asm;

    let done = asm.new_dynamic_label();
    for window in windows {
        let miss = asm.new_dynamic_label();
        match window.shadow_mask {
            None => {
                dynasm!(asm
                    ; .arch x64
                    ; cmp eax, window.base as i32
                    ; jb =>miss
                    ; cmp eax, window.bound as i32
                    ; ja =>miss
                    ; sub eax, window.base as i32
                    ; mov r11, QWORD window.host as i64
                );
                match width {
                    1 => dynasm!(asm ; .arch x64 ; mov [r11 + rax], bl),
                    2 => dynasm!(asm ; .arch x64 ; mov [r11 + rax], bx),
                    4 => dynasm!(asm ; .arch x64 ; mov [r11 + rax], ebx),
                    _ => panic!("bad store width {}", width),
                }
                dynasm!(asm ; .arch x64 ; jmp =>done);
            },
            Some(mask) => {
                dynasm!(asm
                    ; .arch x64
                    ; cmp eax, window.base as i32
                    ; jb =>miss
                    ; mov r11d, eax
                    ; and r11d, mask as i32
                    ; cmp r11d, window.base as i32
                    ; jb =>miss
                    ; cmp r11d, window.bound as i32
                    ; ja =>miss
                    ; sub r11d, window.base as i32
                    ; mov r10, QWORD window.host as i64
                );
                match width {
                    1 => dynasm!(asm ; .arch x64 ; mov [r10 + r11], bl),
                    2 => dynasm!(asm ; .arch x64 ; mov [r10 + r11], bx),
                    4 => dynasm!(asm ; .arch x64 ; mov [r10 + r11], ebx),
                    _ => panic!("bad store width {}", width),
                }
                dynasm!(asm ; .arch x64 ; jmp =>done);
            },
        }
        dynasm!(asm ; .arch x64 ; =>miss);
    }

    match width {
        1 => dynasm!(asm ; .arch x64 ; movzx ecx, bl),
        2 => dynasm!(asm ; .arch x64 ; movzx ecx, bx),
        4 => dynasm!(asm ; .arch x64 ; mov ecx, ebx),
        _ => panic!("bad store width {}", width),
    }
    dynasm!(asm
        ; .arch x64
        ; mov edi, pc as i32
        ; mov esi, eax
        ; mov edx, width as i32
        ; mov r8, QWORD diagnostics
        ; mov rax, QWORD handler
        ; sub rsp, 8
        ; call rax
        ; add rsp, 8
        ; =>done
    );
}

/// Test the per-direction breakpoint count and, when non-zero, spill the
/// scratch registers and scan the table. The guest address is in eax.
#[cfg(feature = "debugging")]
pub(crate) fn emit_breakpoint_check(g: &mut GenContext, pc: u32, direction: AccessDirection) {
    let breakpoints = unsafe { &*g.breakpoints };
    let count = breakpoints.count_cell(direction) as *const _ as usize as i64;
    let table = g.breakpoints as usize as i64;
    let is_read = (direction == AccessDirection::Read) as i32;
    let check = jit_breakpoint_check as usize as i64;

    let asm = &mut *g.asm;
    let skip = asm.new_dynamic_label();
    dynasm!(asm
        ; .arch x64
        ; mov r11, QWORD count
        ; cmp DWORD [r11], 0
        ; jz =>skip
        ; push rax
        ; push rcx
        ; push rdx
        ; mov edi, pc as i32
        ; mov esi, eax
        ; mov edx, is_read
        ; mov rcx, QWORD table
        ; mov rax, QWORD check
        ; call rax
        ; pop rdx
        ; pop rcx
        ; pop rax
        ; =>skip
    );
}

/// Per-instruction runtime trace call, emitted ahead of every instruction
/// when the exec-trace feature is on.
#[cfg(feature = "exec-trace")]
pub(crate) fn emit_exec_trace(asm: &mut Assembler, pc: u32, code: u32) {
    let shim = jit_exec_trace as usize as i64;
    dynasm!(asm
        ; .arch x64
        ; mov edi, pc as i32
        ; mov esi, code as i32
        ; mov rax, QWORD shim
        ; sub rsp, 8
        ; call rax
        ; add rsp, 8
    );
}

cfg_if::cfg_if! {
    if #[cfg(feature = "debugging")] {
        pub(crate) extern "sysv64" fn jit_read_fallback(pc: u32, address: u32, diagnostics: *const Diagnostics) -> u32 {
            let diagnostics = unsafe { &*diagnostics };
            diagnostics.record(MemoryError {
                kind: MemoryErrorKind::InvalidRead,
                pc: pc,
                address: address,
                width: 4,
                value: 0,
            });
            0
        }

        pub(crate) extern "sysv64" fn jit_write_fallback(pc: u32, address: u32, width: u32, value: u32, diagnostics: *const Diagnostics) {
            let diagnostics = unsafe { &*diagnostics };
            diagnostics.record(MemoryError {
                kind: MemoryErrorKind::InvalidWrite,
                pc: pc,
                address: address,
                width: width,
                value: value,
            });
        }
    } else {
        // production absorbs bad guest accesses: reads yield zero, writes
        // are dropped, and the machine keeps running
        pub(crate) extern "sysv64" fn jit_read_fallback(_pc: u32, _address: u32, _diagnostics: *const Diagnostics) -> u32 {
            0
        }

        pub(crate) extern "sysv64" fn jit_write_fallback(_pc: u32, _address: u32, _width: u32, _value: u32, _diagnostics: *const Diagnostics) {
        }
    }
}

#[cfg(feature = "debugging")]
pub(crate) extern "sysv64" fn jit_breakpoint_check(pc: u32, address: u32, is_read: u32, table: *const MemoryBreakpoints) {
    let table = unsafe { &*table };
    let direction = if is_read != 0 { AccessDirection::Read } else { AccessDirection::Write };
    table.scan(pc, address, direction);
}

#[cfg(feature = "exec-trace")]
pub(crate) extern "sysv64" fn jit_exec_trace(pc: u32, code: u32) {
    trace!(target: "EXEC", "[${:08X}]: {:08X}", pc, code);
}

//! Cross-block linking.
//!
//! A block ending in a jump to address A must reach A's native code without
//! an outer dispatch loop, even though A may not be translated yet. Each
//! such exit owns a jump slot: one word of indirection the exit loads and
//! jumps through. A fresh slot points at the shared thunk stub, which calls
//! back into the builder to resolve (and, on a miss, translate) the target,
//! then tail-jumps to it with the stack exactly as it was at the exit. For
//! slots that allow it, the resolver atomically swaps the slot over to the
//! resolved pointer, so every later execution of that exit is a direct jump
//! with the thunk out of the picture. The swap is idempotent: repeated
//! resolution stores the same pointer, and a reader sees either the stub or
//! the final pointer, never a torn word.

#[allow(unused_imports)]
use tracing::{trace, debug, error, warn, info};

use std::sync::atomic::{AtomicUsize, Ordering};

use dynasmrt::{dynasm, DynasmApi, ExecutableBuffer};

use crate::ADDRESS_MASK;
use crate::builder::BlockBuilder;
use crate::cpu::CpuContext;
use crate::gen::{Assembler, GenContext, jump_target_offset};

/// Targets with this bit set leave generated code and return to the driver
/// instead of naming guest code; the rest of the word is the resume pc.
/// Guest addresses keep only their low 30 bits, so the tag can never collide.
pub const TRAP_ADDRESS: u32 = 0x8000_0000;

/// One unresolved (or resolved) block exit. `code` is entered with a plain
/// jump; it starts out pointing at the thunk stub and, when `fixup` is set,
/// is swapped to the target block once that exists.
#[repr(C)]
pub struct JumpSlot {
    code: AtomicUsize,
    target: u32,
    fixup: bool,
}

impl JumpSlot {
    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn fixup(&self) -> bool {
        self.fixup
    }

    pub fn code(&self) -> usize {
        self.code.load(Ordering::Acquire)
    }

    pub(crate) fn patch(&self, code: *const u8) {
        self.code.store(code as usize, Ordering::Release);
    }
}

/// Owns every jump slot ever handed out, keeping their addresses stable for
/// the lifetime of the generated code that bakes them in.
pub struct SlotArena {
    slots: Vec<Box<JumpSlot>>,
}

impl SlotArena {
    pub fn new() -> SlotArena {
        SlotArena {
            slots: Vec::new(),
        }
    }

    pub(crate) fn alloc(&mut self, target: u32, fixup: bool, thunk: *const u8) -> *const JumpSlot {
        let slot = Box::new(JumpSlot {
            code: AtomicUsize::new(thunk as usize),
            target: target,
            fixup: fixup,
        });
        let ptr: *const JumpSlot = &*slot;
        self.slots.push(slot);
        ptr
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub(crate) type BounceFn = unsafe extern "sysv64" fn(*const u8, *mut CpuContext);

/// The fixed native routines generated once at startup: the bounce
/// trampoline, the two thunk stubs and the exit stub. The buffer must
/// outlive every block, so the builder keeps this for its whole life.
pub(crate) struct Stubs {
    #[allow(dead_code)]
    buffer: ExecutableBuffer,
    pub bounce: BounceFn,
    pub thunk: *const u8,
    pub dynamic_thunk: *const u8,
    pub exit: *const u8,
}

impl Stubs {
    pub fn build() -> Stubs {
        let mut asm = Assembler::new().expect("failed to create assembler");

        // Bounce: the sole entry from ordinary code into the generated
        // world. rdi = native entry, rsi = guest context. Saves every
        // callee-saved register blocks may clobber, then parks the context
        // pointer in the reserved stack slot where blocks expect it.
        let bounce = asm.offset();
        dynasm!(asm
            ; .arch x64
            ; push rbp
            ; mov rbp, rsp
            ; push rbx
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; push rsi
            ; call rdi
            ; add rsp, 8
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbx
            ; pop rbp
            ; ret
        );

        // Thunk stub: jumped to from an unresolved exit with rdi = slot and
        // rsi = builder already in place. The push keeps the call aligned
        // and is undone before the tail jump, so the target block sees the
        // stack exactly as the exit left it.
        let resolve_slot = resolve_slot_shim as usize as i64;
        let thunk = asm.offset();
        dynasm!(asm
            ; .arch x64
            ; push rbp
            ; mov rax, QWORD resolve_slot
            ; call rax
            ; pop rbp
            ; jmp rax
        );

        // Dynamic thunk: register jumps carry the guest target in edi
        // instead of a slot. Never patches anything.
        let resolve_target = resolve_target_shim as usize as i64;
        let dynamic_thunk = asm.offset();
        dynasm!(asm
            ; .arch x64
            ; push rbp
            ; mov rax, QWORD resolve_target
            ; call rax
            ; pop rbp
            ; jmp rax
        );

        // Exit stub: the stack is balanced in the generated world, so
        // returning lands back in the bounce.
        let exit = asm.offset();
        dynasm!(asm
            ; .arch x64
            ; ret
        );

        let buffer = match asm.finalize() {
            Ok(buffer) => buffer,
            Err(_) => panic!("failed to assemble stubs"),
        };
        let stubs = Stubs {
            bounce: unsafe { std::mem::transmute::<*const u8, BounceFn>(buffer.ptr(bounce)) },
            thunk: buffer.ptr(thunk),
            dynamic_thunk: buffer.ptr(dynamic_thunk),
            exit: buffer.ptr(exit),
            buffer: buffer,
        };

        debug!(target: "JIT", "stubs built: bounce={:?} thunk={:?} dynamic={:?} exit={:?}",
               stubs.bounce as *const u8, stubs.thunk, stubs.dynamic_thunk, stubs.exit);
        stubs
    }
}

extern "sysv64" fn resolve_slot_shim(slot: *const JumpSlot, builder: *mut BlockBuilder) -> *const u8 {
    unsafe { (*builder).resolve_slot(&*slot) }
}

extern "sysv64" fn resolve_target_shim(target: u32, builder: *mut BlockBuilder) -> *const u8 {
    unsafe { (*builder).resolve_target(target) }
}

/// Block exit to a statically known target: allocate a slot and jump
/// through it. Three moves and a jump once the slot is resolved.
pub(crate) fn emit_jump_site(g: &mut GenContext, target: u32, fixup: bool) {
    let slot = g.slots.alloc(target, fixup, g.thunk);
    let slot_addr = slot as usize as i64;
    let builder_addr = g.builder as usize as i64;

    let asm = &mut *g.asm;
    dynasm!(asm
        ; .arch x64
        ; mov rdi, QWORD slot_addr
        ; mov rsi, QWORD builder_addr
        ; mov rax, [rdi]        // JumpSlot.code is the first field
        ; jmp rax
    );
}

/// Block exit through the latched register target. The tag test happens in
/// the resolver, so the raw value goes through unmasked.
pub(crate) fn emit_register_jump(g: &mut GenContext) {
    let builder_addr = g.builder as usize as i64;
    let stub = g.dynamic_thunk as usize as i64;

    let asm = &mut *g.asm;
    dynasm!(asm
        ; .arch x64
        ; mov edi, [rbp + jump_target_offset()]
        ; mov rsi, QWORD builder_addr
        ; mov rax, QWORD stub
        ; jmp rax
    );
}

/// Block exit back to the driver. Trap slots never fix up: the resolver has
/// to run every time to store the resume pc.
pub(crate) fn emit_trap_exit(g: &mut GenContext, resume: u32) {
    emit_jump_site(g, TRAP_ADDRESS | (resume & ADDRESS_MASK), false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_patch_is_idempotent() {
        let mut arena = SlotArena::new();
        let stub = 0x1000 as *const u8;
        let slot = arena.alloc(0x0800_0010, true, stub);
        let slot = unsafe { &*slot };

        assert_eq!(slot.code(), 0x1000);
        assert_eq!(slot.target(), 0x0800_0010);
        assert!(slot.fixup());

        let resolved = 0x2000 as *const u8;
        slot.patch(resolved);
        assert_eq!(slot.code(), 0x2000);
        // re-resolving after a lost race stores the same pointer again
        slot.patch(resolved);
        assert_eq!(slot.code(), 0x2000);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn bounce_returns_through_exit_stub() {
        let stubs = Stubs::build();
        let mut ctx = CpuContext::new();
        // entering the exit stub directly unwinds straight back out
        unsafe { (stubs.bounce)(stubs.exit, &mut ctx) };
    }
}

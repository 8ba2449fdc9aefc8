//! Generators for the guest load/store opcodes. Each is a pure function of
//! (pass, instruction address, decoded fields) over the generation context:
//! pass 0 classifies only, pass 1 emits. Loads with a zero destination still
//! perform the access so faults and breakpoints fire, but skip the
//! writeback; register 0 stays zero.

use dynasmrt::{dynasm, DynasmApi};

use crate::builder::Decoded;
use crate::gen::*;

pub(crate) fn lb(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        emit_memory_read(g, address);

        // byte mask & sign extend
        let asm = &mut *g.asm;
        dynasm!(asm ; .arch x64 ; movsx eax, al);
        if i.rt != 0 {
            dynasm!(asm ; .arch x64 ; mov [rbp + reg_offset(i.rt)], eax);
        }
    }
    GenResult::Success
}

pub(crate) fn lh(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        emit_memory_read(g, address);

        // halfword mask & sign extend
        let asm = &mut *g.asm;
        dynasm!(asm ; .arch x64 ; movsx eax, ax);
        if i.rt != 0 {
            dynasm!(asm ; .arch x64 ; mov [rbp + reg_offset(i.rt)], eax);
        }
    }
    GenResult::Success
}

pub(crate) fn lw(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        emit_memory_read(g, address);

        if i.rt != 0 {
            let asm = &mut *g.asm;
            dynasm!(asm ; .arch x64 ; mov [rbp + reg_offset(i.rt)], eax);
        }
    }
    GenResult::Success
}

pub(crate) fn lbu(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        emit_memory_read(g, address);

        let asm = &mut *g.asm;
        dynasm!(asm ; .arch x64 ; and eax, 0x0000_00FF);
        if i.rt != 0 {
            dynasm!(asm ; .arch x64 ; mov [rbp + reg_offset(i.rt)], eax);
        }
    }
    GenResult::Success
}

pub(crate) fn lhu(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        emit_memory_read(g, address);

        let asm = &mut *g.asm;
        dynasm!(asm ; .arch x64 ; and eax, 0x0000_FFFF);
        if i.rt != 0 {
            dynasm!(asm ; .arch x64 ; mov [rbp + reg_offset(i.rt)], eax);
        }
    }
    GenResult::Success
}

// Unaligned left load. The loaded word fills the destination's high bytes:
//   addr & 3 == 0  ->  reg = (reg & 0x00FFFFFF) | (mem << 24)
//   addr & 3 == 1  ->  reg = (reg & 0x0000FFFF) | (mem << 16)
//   addr & 3 == 2  ->  reg = (reg & 0x000000FF) | (mem <<  8)
//   addr & 3 == 3  ->  reg = mem
// The shift count is ((addr & 3) ^ 3) * 8; shifting -1 left by it builds the
// memory-side mask, and its complement keeps the untouched register bytes.
pub(crate) fn lwl(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        {
            let asm = &mut *g.asm;
            dynasm!(asm
                ; .arch x64
                ; mov ecx, eax          // unaligned address survives the read
                ; and eax, -4
            );
        }
        emit_memory_read(g, address);

        let asm = &mut *g.asm;
        dynasm!(asm
            ; .arch x64
            ; and ecx, 3
            ; xor ecx, 3
            ; shl ecx, 3
            ; mov ebx, -1
            ; shl ebx, cl
            ; shl eax, cl
            ; and eax, ebx
            ; not ebx
            ; mov ecx, [rbp + reg_offset(i.rt)]
            ; and ecx, ebx
            ; or eax, ecx
        );
        if i.rt != 0 {
            dynasm!(asm ; .arch x64 ; mov [rbp + reg_offset(i.rt)], eax);
        }
    }
    GenResult::Success
}

// Unaligned right load: the mirror image of lwl. Shift count is
// (addr & 3) * 8 and the loaded word shifts right into the low bytes.
pub(crate) fn lwr(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        {
            let asm = &mut *g.asm;
            dynasm!(asm
                ; .arch x64
                ; mov ecx, eax
                ; and eax, -4
            );
        }
        emit_memory_read(g, address);

        let asm = &mut *g.asm;
        dynasm!(asm
            ; .arch x64
            ; and ecx, 3
            ; shl ecx, 3
            ; mov ebx, -1
            ; shr ebx, cl
            ; shr eax, cl
            ; and eax, ebx
            ; not ebx
            ; mov ecx, [rbp + reg_offset(i.rt)]
            ; and ecx, ebx
            ; or eax, ecx
        );
        if i.rt != 0 {
            dynasm!(asm ; .arch x64 ; mov [rbp + reg_offset(i.rt)], eax);
        }
    }
    GenResult::Success
}

pub(crate) fn sb(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        {
            let asm = &mut *g.asm;
            dynasm!(asm ; .arch x64 ; mov ebx, [rbp + reg_offset(i.rt)]);
        }
        emit_memory_write(g, address, 1);
    }
    GenResult::Success
}

pub(crate) fn sh(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        {
            let asm = &mut *g.asm;
            dynasm!(asm ; .arch x64 ; mov ebx, [rbp + reg_offset(i.rt)]);
        }
        emit_memory_write(g, address, 2);
    }
    GenResult::Success
}

pub(crate) fn sw(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        {
            let asm = &mut *g.asm;
            dynasm!(asm ; .arch x64 ; mov ebx, [rbp + reg_offset(i.rt)]);
        }
        emit_memory_write(g, address, 4);
    }
    GenResult::Success
}

// Unaligned left store: read-modify-write of the aligned word.
//   addr & 3 == 0  ->  mem = (mem & 0xFFFFFF00) | (reg >> 24)
//   addr & 3 == 3  ->  mem = reg
// Shift count ((addr & 3) ^ 3) * 8; -1 shifted right by it masks the
// register contribution, its complement the preserved memory bytes. The
// shift already clears the register's high bits, so no extra mask is needed
// on that side.
pub(crate) fn swl(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        {
            let asm = &mut *g.asm;
            dynasm!(asm
                ; .arch x64
                ; mov ecx, eax
                ; and eax, -4
            );
        }
        emit_memory_read(g, address);

        {
            let asm = &mut *g.asm;
            dynasm!(asm
                ; .arch x64
                ; and ecx, 3
                ; xor ecx, 3
                ; shl ecx, 3
                ; mov ebx, -1
                ; shr ebx, cl
                ; mov edx, [rbp + reg_offset(i.rt)]
                ; shr edx, cl
                ; and edx, ebx
                ; not ebx
                ; and eax, ebx
                ; or eax, edx
                ; mov ebx, eax
            );
        }

        // the scratch registers are gone, so re-derive the address
        emit_effective_address(g.asm, i.rs, i.imm);
        {
            let asm = &mut *g.asm;
            dynasm!(asm ; .arch x64 ; and eax, -4);
        }
        emit_memory_write(g, address, 4);
    }
    GenResult::Success
}

// Unaligned right store: mirror of swl with shift count (addr & 3) * 8.
pub(crate) fn swr(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        {
            let asm = &mut *g.asm;
            dynasm!(asm
                ; .arch x64
                ; mov ecx, eax
                ; and eax, -4
            );
        }
        emit_memory_read(g, address);

        {
            let asm = &mut *g.asm;
            dynasm!(asm
                ; .arch x64
                ; and ecx, 3
                ; shl ecx, 3
                ; mov ebx, -1
                ; shl ebx, cl
                ; mov edx, [rbp + reg_offset(i.rt)]
                ; shl edx, cl
                ; and edx, ebx
                ; not ebx
                ; and eax, ebx
                ; or eax, edx
                ; mov ebx, eax
            );
        }

        emit_effective_address(g.asm, i.rs, i.imm);
        {
            let asm = &mut *g.asm;
            dynasm!(asm ; .arch x64 ; and eax, -4);
        }
        emit_memory_write(g, address, 4);
    }
    GenResult::Success
}

// Guest cache maintenance. No caches are modeled, so this translates to
// nothing at all.
pub(crate) fn cache(_g: &mut GenContext, _pass: usize, _address: u32, _i: &Decoded) -> GenResult {
    GenResult::Success
}

// Load-linked / store-conditional are not modeled; refusing them aborts the
// block instead of emitting code with the wrong atomicity.
pub(crate) fn ll(_g: &mut GenContext, _pass: usize, _address: u32, _i: &Decoded) -> GenResult {
    GenResult::Invalid
}

pub(crate) fn sc(_g: &mut GenContext, _pass: usize, _address: u32, _i: &Decoded) -> GenResult {
    GenResult::Invalid
}

// Coprocessor loads/stores. The coprocessor number sits in the low two bits
// of the opcode; only coprocessor 1 is wired up, and it moves the raw 32-bit
// pattern with no conversion.
pub(crate) fn lwc(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    let cop = i.op & 3;
    if cop != 1 {
        return GenResult::Invalid;
    }

    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        emit_memory_read(g, address);

        let asm = &mut *g.asm;
        dynasm!(asm ; .arch x64 ; mov [rbp + cp1_offset(i.rt)], eax);
    }
    GenResult::Success
}

pub(crate) fn swc(g: &mut GenContext, pass: usize, address: u32, i: &Decoded) -> GenResult {
    let cop = i.op & 3;
    if cop != 1 {
        return GenResult::Invalid;
    }

    if pass == 1 {
        emit_effective_address(g.asm, i.rs, i.imm);
        {
            let asm = &mut *g.asm;
            dynasm!(asm ; .arch x64 ; mov ebx, [rbp + cp1_offset(i.rt)]);
        }
        emit_memory_write(g, address, 4);
    }
    GenResult::Success
}

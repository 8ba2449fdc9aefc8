// End-to-end tests: build blocks from hand-encoded guest instructions and
// execute the generated native code.
#![cfg(target_arch = "x86_64")]

use allegrex::Config;
use allegrex::builder::BuildError;
use allegrex::cpu::Cpu;
use allegrex::mem::{Memory, MemoryConfig};

const MAIN: u32 = 0x0800_0000;
const DATA: u32 = 0x0800_0100;

fn new_cpu() -> Cpu {
    Cpu::new(Memory::new(MemoryConfig::default()), Config::default())
}

fn load_program(cpu: &mut Cpu, address: u32, words: &[u32]) {
    for (n, word) in words.iter().enumerate() {
        cpu.memory_mut().write_u32(*word, address + 4 * n as u32).unwrap();
    }
}

fn itype(op: u32, rs: u32, rt: u32, imm: u16) -> u32 {
    (op << 26) | (rs << 21) | (rt << 16) | imm as u32
}

fn rtype(funct: u32, rs: u32, rt: u32, rd: u32, sa: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | (sa << 6) | funct
}

fn lb(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x20, rs, rt, imm as u16) }
fn lh(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x21, rs, rt, imm as u16) }
fn lwl(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x22, rs, rt, imm as u16) }
fn lw(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x23, rs, rt, imm as u16) }
fn lbu(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x24, rs, rt, imm as u16) }
fn lhu(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x25, rs, rt, imm as u16) }
fn lwr(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x26, rs, rt, imm as u16) }
fn sb(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x28, rs, rt, imm as u16) }
fn sh(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x29, rs, rt, imm as u16) }
fn swl(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x2A, rs, rt, imm as u16) }
fn sw(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x2B, rs, rt, imm as u16) }
fn swr(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x2E, rs, rt, imm as u16) }
fn cache_op(op: u32, rs: u32, imm: i16) -> u32 { itype(0x2F, rs, op, imm as u16) }
fn ll(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x30, rs, rt, imm as u16) }
fn lwc1(ft: u32, rs: u32, imm: i16) -> u32 { itype(0x31, rs, ft, imm as u16) }
fn swc1(ft: u32, rs: u32, imm: i16) -> u32 { itype(0x39, rs, ft, imm as u16) }

fn addiu(rt: u32, rs: u32, imm: i16) -> u32 { itype(0x09, rs, rt, imm as u16) }
fn ori(rt: u32, rs: u32, imm: u16) -> u32 { itype(0x0D, rs, rt, imm) }
fn lui(rt: u32, imm: u16) -> u32 { itype(0x0F, 0, rt, imm) }
fn addu(rd: u32, rs: u32, rt: u32) -> u32 { rtype(0x21, rs, rt, rd, 0) }
fn sltu(rd: u32, rs: u32, rt: u32) -> u32 { rtype(0x2B, rs, rt, rd, 0) }

fn j(target: u32) -> u32 { (0x02 << 26) | ((target >> 2) & 0x03FF_FFFF) }
fn beq(rs: u32, rt: u32, offset: i16) -> u32 { itype(0x04, rs, rt, offset as u16) }
fn bne(rs: u32, rt: u32, offset: i16) -> u32 { itype(0x05, rs, rt, offset as u16) }
fn jr(rs: u32) -> u32 { rtype(0x08, rs, 0, 0, 0) }
fn syscall() -> u32 { rtype(0x0C, 0, 0, 0, 0) }
fn nop() -> u32 { 0 }

#[test]
fn lw_reads_main_memory() {
    let mut cpu = new_cpu();
    cpu.memory_mut().write_u32(0xDEAD_BEEF, DATA).unwrap();
    cpu.context_mut().registers[4] = DATA;

    load_program(&mut cpu, MAIN, &[lw(8, 4, 0), syscall()]);
    let pc = cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[8], 0xDEAD_BEEF);
    assert_eq!(pc, MAIN + 8);
}

#[test]
fn lw_with_negative_offset() {
    let mut cpu = new_cpu();
    cpu.memory_mut().write_u32(0x0BAD_F00D, DATA).unwrap();
    cpu.context_mut().registers[4] = DATA + 4;

    load_program(&mut cpu, MAIN, &[lw(8, 4, -4), syscall()]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[8], 0x0BAD_F00D);
}

#[test]
fn lb_sign_extends_lbu_does_not() {
    let mut cpu = new_cpu();
    cpu.memory_mut().write_u8(0xFF, DATA).unwrap();
    cpu.context_mut().registers[4] = DATA;

    load_program(&mut cpu, MAIN, &[lb(8, 4, 0), lbu(9, 4, 0), syscall()]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[8], 0xFFFF_FFFF);
    assert_eq!(cpu.context().registers[9], 0x0000_00FF);
}

#[test]
fn lh_sign_extends_lhu_does_not() {
    let mut cpu = new_cpu();
    cpu.memory_mut().write_u16(0x8001, DATA).unwrap();
    cpu.context_mut().registers[4] = DATA;

    load_program(&mut cpu, MAIN, &[lh(8, 4, 0), lhu(9, 4, 0), syscall()]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[8], 0xFFFF_8001);
    assert_eq!(cpu.context().registers[9], 0x0000_8001);
}

#[test]
fn stores_hit_main_memory_at_each_width() {
    let mut cpu = new_cpu();
    cpu.context_mut().registers[4] = 0x0800_0200;
    cpu.context_mut().registers[8] = 0x1122_3344;

    load_program(&mut cpu, MAIN, &[sb(8, 4, 0), sh(8, 4, 4), sw(8, 4, 8), syscall()]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.memory().read_u8(0x0800_0200).unwrap(), 0x44);
    assert_eq!(cpu.memory().read_u16(0x0800_0204).unwrap(), 0x3344);
    assert_eq!(cpu.memory().read_u32(0x0800_0208).unwrap(), 0x1122_3344);
}

#[test]
fn loads_to_register_zero_are_discarded() {
    let mut cpu = new_cpu();
    cpu.memory_mut().write_u32(0x1234_5678, DATA).unwrap();
    cpu.context_mut().registers[4] = DATA;

    load_program(&mut cpu, MAIN, &[lw(0, 4, 0), syscall()]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[0], 0);
}

#[test]
fn lwl_merges_into_the_high_bytes() {
    let mut cpu = new_cpu();
    let base = 0x0800_0140;
    cpu.memory_mut().write_u32(0x1122_3344, base).unwrap();
    cpu.context_mut().registers[4] = base;
    cpu.context_mut().registers[8] = 0xAABB_CCDD;

    // address & 3 == 1: reg = (reg & 0x0000FFFF) | (mem << 16)
    load_program(&mut cpu, MAIN, &[lwl(8, 4, 1), syscall()]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[8], 0x3344_CCDD);
}

#[test]
fn lwl_lwr_pair_loads_unaligned_words() {
    let bytes: [u8; 8] = [0x10, 0x21, 0x32, 0x43, 0x54, 0x65, 0x76, 0x87];

    for k in 0..4u32 {
        let mut cpu = new_cpu();
        let base = 0x0800_0160;
        cpu.memory_mut().write_block(base, &bytes).unwrap();
        cpu.context_mut().registers[4] = base + k;

        load_program(&mut cpu, MAIN, &[lwl(8, 4, 3), lwr(8, 4, 0), syscall()]);
        cpu.run(MAIN).unwrap();

        let k = k as usize;
        let expected = u32::from_le_bytes([bytes[k], bytes[k + 1], bytes[k + 2], bytes[k + 3]]);
        assert_eq!(cpu.context().registers[8], expected, "alignment {}", k);
    }
}

#[test]
fn swl_swr_then_lwl_lwr_round_trips_at_every_alignment() {
    let value = 0x1122_3344u32;

    for k in 0..4u32 {
        let mut cpu = new_cpu();
        let base = 0x0800_01A0;
        cpu.memory_mut().write_block(base, &[0xEE; 12]).unwrap();
        cpu.context_mut().registers[4] = base + k;
        cpu.context_mut().registers[8] = value;

        load_program(&mut cpu, MAIN, &[
            swl(8, 4, 3), swr(8, 4, 0),
            lwl(9, 4, 3), lwr(9, 4, 0),
            syscall(),
        ]);
        cpu.run(MAIN).unwrap();

        // the register reconstructs bit for bit
        assert_eq!(cpu.context().registers[9], value, "alignment {}", k);

        // the bytes landed where the unaligned address says, neighbors intact
        for n in 0..12u32 {
            let byte = cpu.memory().read_u8(base + n).unwrap();
            let expected = if n >= k && n < k + 4 {
                value.to_le_bytes()[(n - k) as usize]
            } else {
                0xEE
            };
            assert_eq!(byte, expected, "alignment {} byte {}", k, n);
        }
    }
}

#[test]
fn framebuffer_shadow_addresses_reach_the_framebuffer() {
    let mut cpu = new_cpu();
    // differs from 0x04000120 only in bits the shadow mask strips
    cpu.context_mut().registers[4] = 0x0420_0120;
    cpu.context_mut().registers[8] = 0xCAFE_BABE;

    load_program(&mut cpu, MAIN, &[sw(8, 4, 0), lw(9, 4, 0), syscall()]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.memory().read_u32(0x0400_0120).unwrap(), 0xCAFE_BABE);
    assert_eq!(cpu.context().registers[9], 0xCAFE_BABE);
}

#[cfg(feature = "scratchpad")]
#[test]
fn scratchpad_window_round_trips() {
    let mut cpu = new_cpu();
    cpu.context_mut().registers[4] = 0x0001_0000;
    cpu.context_mut().registers[8] = 0x5A5A_1234;

    load_program(&mut cpu, MAIN, &[sw(8, 4, 0), lw(9, 4, 0), syscall()]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[9], 0x5A5A_1234);
}

#[cfg(not(feature = "debugging"))]
#[test]
fn unmapped_accesses_are_absorbed_in_production() {
    let mut cpu = new_cpu();
    cpu.context_mut().registers[4] = 0x00F0_0000;
    cpu.context_mut().registers[8] = 0x5555_5555;
    cpu.context_mut().registers[9] = 0x5555_5555;

    // the write is dropped, the read comes back as zero
    load_program(&mut cpu, MAIN, &[sw(8, 4, 0), lw(9, 4, 0), syscall()]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[9], 0);
}

#[cfg(feature = "debugging")]
#[test]
fn unmapped_accesses_raise_structured_faults() {
    use allegrex::mem::MemoryErrorKind;

    let mut cpu = new_cpu();
    cpu.context_mut().registers[4] = 0x00F0_0000;
    cpu.context_mut().registers[8] = 0x5555_5555;

    load_program(&mut cpu, MAIN, &[sw(8, 4, 0), lw(9, 4, 0), syscall()]);
    cpu.run(MAIN).unwrap();

    let faults = cpu.diagnostics().take_faults();
    assert_eq!(faults.len(), 2);
    assert_eq!(faults[0].kind, MemoryErrorKind::InvalidWrite);
    assert_eq!(faults[0].pc, MAIN);
    assert_eq!(faults[0].address, 0x00F0_0000);
    assert_eq!(faults[0].width, 4);
    assert_eq!(faults[0].value, 0x5555_5555);
    assert_eq!(faults[1].kind, MemoryErrorKind::InvalidRead);
    assert_eq!(faults[1].pc, MAIN + 4);
}

#[cfg(feature = "debugging")]
#[test]
fn memory_breakpoints_fire_on_matching_reads() {
    use allegrex::breakpoints::AccessDirection;

    let mut cpu = new_cpu();
    cpu.memory_mut().write_u32(1, DATA).unwrap();
    cpu.context_mut().registers[4] = DATA;
    let id = cpu.breakpoints().register(DATA, AccessDirection::Read).unwrap();

    load_program(&mut cpu, MAIN, &[lw(8, 4, 0), syscall()]);
    cpu.run(MAIN).unwrap();

    let hit = cpu.breakpoints().last_hit().unwrap();
    assert_eq!(hit.id, id);
    assert_eq!(hit.pc, MAIN);
    assert_eq!(hit.address, DATA);
    assert_eq!(hit.direction, AccessDirection::Read);
}

#[test]
fn cache_translates_to_nothing() {
    let mut cpu = new_cpu();
    cpu.context_mut().registers[4] = DATA;

    load_program(&mut cpu, MAIN, &[cache_op(0x14, 4, 0), syscall()]);
    let pc = cpu.run(MAIN).unwrap();
    assert_eq!(pc, MAIN + 8);
}

#[test]
fn coprocessor1_moves_raw_patterns() {
    let mut cpu = new_cpu();
    cpu.memory_mut().write_u32(0x3F80_0000, DATA).unwrap();
    cpu.context_mut().registers[4] = DATA;

    load_program(&mut cpu, MAIN, &[lwc1(5, 4, 0), swc1(5, 4, 8), syscall()]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().cp1_registers[5], 0x3F80_0000);
    assert_eq!(cpu.memory().read_u32(DATA + 8).unwrap(), 0x3F80_0000);
}

#[test]
fn ll_aborts_the_block() {
    let mut cpu = new_cpu();
    load_program(&mut cpu, MAIN, &[ll(8, 4, 0), syscall()]);

    let err = cpu.run(MAIN).unwrap_err();
    assert_eq!(err, BuildError::Unsupported { address: MAIN, code: ll(8, 4, 0) });
    // nothing half-built was cached
    assert!(cpu.builder().cache().is_empty());
}

#[test]
fn unmapped_entry_is_an_invalid_address() {
    let mut cpu = new_cpu();
    let err = cpu.run(0x00F0_0000).unwrap_err();
    assert_eq!(err, BuildError::InvalidAddress { address: 0x00F0_0000 });
}

#[test]
#[should_panic(expected = "duplicate block build")]
fn duplicate_build_is_rejected() {
    let mut cpu = new_cpu();
    load_program(&mut cpu, MAIN, &[syscall()]);

    cpu.run(MAIN).unwrap();
    cpu.builder_mut().build(MAIN).unwrap();
}

#[test]
fn alu_subset_computes() {
    let mut cpu = new_cpu();
    load_program(&mut cpu, MAIN, &[
        lui(8, 0x1234),
        ori(8, 8, 0x5678),
        addu(10, 8, 8),
        sltu(11, 8, 10),
        addiu(12, 8, -8),
        syscall(),
    ]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[8], 0x1234_5678);
    assert_eq!(cpu.context().registers[10], 0x2468_ACF0);
    assert_eq!(cpu.context().registers[11], 1);
    assert_eq!(cpu.context().registers[12], 0x1234_5670);
}

// The linking scenario: a block ending in a jump to a not-yet-built address
// goes through the missing-block thunk exactly once; after the slot is
// patched the second execution jumps straight to the target block.
#[test]
fn thunk_builds_and_links_the_target_block() {
    let mut cpu = new_cpu();
    cpu.memory_mut().write_u32(0xDEAD_BEEF, DATA).unwrap();
    cpu.context_mut().registers[4] = DATA;

    load_program(&mut cpu, MAIN, &[lw(8, 4, 0), j(MAIN + 0x10), nop()]);
    load_program(&mut cpu, MAIN + 0x10, &[addiu(9, 0, 0x1234), syscall()]);

    let pc = cpu.run(MAIN).unwrap();
    assert_eq!(pc, MAIN + 0x18);
    assert_eq!(cpu.context().registers[8], 0xDEAD_BEEF);
    assert_eq!(cpu.context().registers[9], 0x1234);

    #[cfg(feature = "statistics")]
    {
        use atomic_counter::AtomicCounter;
        assert_eq!(cpu.stats().blocks_generated.get(), 2);
        assert_eq!(cpu.stats().thunk_builds.get(), 1);
        // one resolution for the jump, one for the trap exit
        let first_run_calls = cpu.stats().thunk_calls.get();
        assert_eq!(first_run_calls, 2);

        // second execution: the patched slot bypasses the thunk, only the
        // trap exit resolves
        cpu.context_mut().registers[9] = 0;
        cpu.run(MAIN).unwrap();
        assert_eq!(cpu.context().registers[9], 0x1234);
        assert_eq!(cpu.stats().thunk_calls.get(), first_run_calls + 1);
        assert_eq!(cpu.stats().blocks_generated.get(), 2);
        assert_eq!(cpu.stats().thunk_builds.get(), 1);
    }
}

#[test]
fn branch_taken_skips_the_fallthrough() {
    let mut cpu = new_cpu();
    load_program(&mut cpu, MAIN, &[
        beq(0, 0, 3),       // always taken, to MAIN + 0x10
        nop(),
        addiu(9, 0, 1),     // fallthrough path
        syscall(),
        addiu(10, 0, 2),    // taken path at MAIN + 0x10
        syscall(),
    ]);
    let pc = cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[9], 0);
    assert_eq!(cpu.context().registers[10], 2);
    assert_eq!(pc, MAIN + 0x18);
}

#[test]
fn branch_not_taken_falls_through() {
    let mut cpu = new_cpu();
    load_program(&mut cpu, MAIN, &[
        bne(0, 0, 3),       // never taken
        nop(),
        addiu(9, 0, 1),
        syscall(),
        addiu(10, 0, 2),
        syscall(),
    ]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[9], 1);
    assert_eq!(cpu.context().registers[10], 0);
}

#[test]
fn branch_condition_is_latched_before_the_delay_slot() {
    let mut cpu = new_cpu();
    cpu.context_mut().registers[8] = 5;
    load_program(&mut cpu, MAIN, &[
        bne(8, 0, 3),       // r8 != 0 at branch time, so taken...
        addiu(8, 0, 0),     // ...even though the delay slot zeroes r8
        addiu(9, 0, 1),
        syscall(),
        addiu(10, 0, 2),
        syscall(),
    ]);
    cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[8], 0);
    assert_eq!(cpu.context().registers[9], 0);
    assert_eq!(cpu.context().registers[10], 2);
}

#[test]
fn register_jump_reaches_guest_code() {
    let mut cpu = new_cpu();
    cpu.context_mut().registers[9] = MAIN + 0x20;
    load_program(&mut cpu, MAIN, &[jr(9), nop()]);
    load_program(&mut cpu, MAIN + 0x20, &[syscall()]);

    let pc = cpu.run(MAIN).unwrap();
    assert_eq!(pc, MAIN + 0x24);
}

// A trap-tagged link register value exits generated code with the untagged
// address as the resume pc.
#[test]
fn register_jump_honors_the_trap_tag() {
    let mut cpu = new_cpu();
    cpu.context_mut().registers[31] = 0x8000_0000 | 0x0034_5678;
    load_program(&mut cpu, MAIN, &[jr(31), nop()]);

    let pc = cpu.run(MAIN).unwrap();
    assert_eq!(pc, 0x0034_5678);
}

#[test]
fn overlong_blocks_fall_through_to_a_linked_continuation() {
    let mut config = Config::default();
    config.max_block_instructions = 2;
    let mut cpu = Cpu::new(Memory::new(MemoryConfig::default()), config);

    load_program(&mut cpu, MAIN, &[
        addiu(8, 0, 1),
        addiu(9, 0, 2),
        addiu(10, 0, 3),    // lands in the continuation block
        syscall(),
    ]);
    let pc = cpu.run(MAIN).unwrap();

    assert_eq!(cpu.context().registers[8], 1);
    assert_eq!(cpu.context().registers[9], 2);
    assert_eq!(cpu.context().registers[10], 3);
    assert_eq!(pc, MAIN + 0x10);
    assert_eq!(cpu.builder().cache().len(), 2);
}

#[test]
fn entry_mask_is_idempotent() {
    let mut cpu = new_cpu();
    load_program(&mut cpu, MAIN, &[syscall()]);

    // the reserved top bits never produce a second block
    cpu.run(MAIN).unwrap();
    cpu.run(MAIN | 0x4000_0000).unwrap();
    assert_eq!(cpu.builder().cache().len(), 1);
}

//! The block builder: turns one run of guest instructions into one native
//! code block. Pass 0 walks the guest code to find the block's extent and
//! refuses anything the generators can't translate, before a single byte is
//! emitted; pass 1 emits the block, its optional instrumentation and the
//! exit. The builder is also the thunk's resolver: unresolved block exits
//! call back in here to look up or translate their targets.

#[allow(unused_imports)]
use tracing::{trace, debug, error, warn, info};

#[cfg(feature = "statistics")]
use atomic_counter::AtomicCounter;
use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi};

use crate::ADDRESS_MASK;
use crate::Config;
use crate::breakpoints::MemoryBreakpoints;
use crate::cache::{CodeBlock, CodeCache};
use crate::cpu::CpuContext;
use crate::gen::{Assembler, GenContext, GenResult, branch_flag_offset};
use crate::gen_memory::*;
use crate::gen_simple::*;
use crate::mem::{Diagnostics, Memory, MemoryWindow, translate_windows};
use crate::stats::JitStats;
use crate::thunk::{BounceFn, JumpSlot, SlotArena, Stubs, TRAP_ADDRESS, emit_jump_site, emit_register_jump, emit_trap_exit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// instruction recognized but not translatable; the block is abandoned
    /// rather than emitted partially
    Unsupported { address: u32, code: u32 },
    /// instruction fetch from an unmapped guest address
    InvalidAddress { address: u32 },
}

/// Fields extracted from one instruction word.
#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    pub v: u32,
    pub op: u32,
    pub rs: usize,
    pub rt: usize,
    pub rd: usize,
    pub sa: u32,
    pub funct: u32,
    pub imm: u16,
    pub target: u32,
}

impl Decoded {
    pub fn new(v: u32) -> Decoded {
        Decoded {
            v: v,
            op: v >> 26,
            rs: ((v >> 21) & 0x1F) as usize,
            rt: ((v >> 16) & 0x1F) as usize,
            rd: ((v >> 11) & 0x1F) as usize,
            sa: (v >> 6) & 0x1F,
            funct: v & 0x3F,
            imm: (v & 0xFFFF) as u16,
            target: v & 0x3FF_FFFF,
        }
    }
}

type InstGen = fn(&mut GenContext, usize, u32, &Decoded) -> GenResult;

fn inst_invalid(_g: &mut GenContext, _pass: usize, _address: u32, _i: &Decoded) -> GenResult {
    GenResult::Invalid
}

// Opcode dispatch. Index 0 (SPECIAL) goes through the funct table instead;
// REGIMM, the coprocessor operate groups and the branch-likely family are
// not translated and abort the block.
static INSTRUCTION_TABLE: [InstGen; 64] = [
                    //   _000          _001          _010          _011          _100          _101          _110          _111
    /* 000_ */  inst_invalid, inst_invalid, j           , jal         , beq         , bne         , blez        , bgtz        ,
    /* 001_ */  addi        , addiu       , slti        , sltiu       , andi        , ori         , xori        , lui         ,
    /* 010_ */  inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid,
    /* 011_ */  inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid,
    /* 100_ */  lb          , lh          , lwl         , lw          , lbu         , lhu         , lwr         , inst_invalid,
    /* 101_ */  sb          , sh          , swl         , sw          , inst_invalid, inst_invalid, swr         , cache       ,
    /* 110_ */  ll          , lwc         , lwc         , inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid,
    /* 111_ */  sc          , swc         , swc         , inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid,
];

static SPECIAL_TABLE: [InstGen; 64] = [
                    //   _000          _001          _010          _011          _100          _101          _110          _111
    /* 000_ */  sll         , inst_invalid, srl         , sra         , sllv        , inst_invalid, srlv        , srav        ,
    /* 001_ */  jr          , jalr        , inst_invalid, inst_invalid, syscall     , break_      , inst_invalid, inst_invalid,
    /* 010_ */  inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid,
    /* 011_ */  inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid,
    /* 100_ */  inst_invalid, addu        , inst_invalid, subu        , and         , or          , xor         , nor         ,
    /* 101_ */  inst_invalid, inst_invalid, slt         , sltu        , inst_invalid, inst_invalid, inst_invalid, inst_invalid,
    /* 110_ */  inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid,
    /* 111_ */  inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid, inst_invalid,
];

fn lookup(i: &Decoded) -> InstGen {
    if i.op == 0 {
        SPECIAL_TABLE[i.funct as usize]
    } else {
        INSTRUCTION_TABLE[i.op as usize]
    }
}

struct Planned {
    address: u32,
    inst: Decoded,
}

enum Ending {
    Fallthrough { next: u32 },
    Jump { target: u32 },
    Branch { target: u32, fallthrough: u32 },
    Register,
    Trap { resume: u32 },
}

struct BlockPlan {
    body: Vec<Planned>,
    ending: Ending,
}

fn fetch(windows: &[MemoryWindow], address: u32) -> Result<u32, BuildError> {
    let (index, offset) = translate_windows(windows, address)
        .ok_or(BuildError::InvalidAddress { address: address })?;
    let window = &windows[index];
    let mut bytes = [0u8; 4];
    unsafe { std::ptr::copy_nonoverlapping(window.host.add(offset), bytes.as_mut_ptr(), 4) };
    Ok(u32::from_le_bytes(bytes))
}

// Pass 0. Nothing is emitted; every instruction is classified so an
// unsupported one aborts before any code exists. Control transfers pull
// their delay slot into the block.
fn scan(g: &mut GenContext, address: u32, max_instructions: usize) -> Result<BlockPlan, BuildError> {
    let mut body = Vec::new();
    let mut pc = address;

    loop {
        let word = fetch(g.windows, pc)?;
        let inst = Decoded::new(word);
        let outcome = lookup(&inst)(g, 0, pc, &inst);

        match outcome {
            GenResult::Invalid => {
                return Err(BuildError::Unsupported { address: pc, code: word });
            },

            GenResult::Success => {
                body.push(Planned { address: pc, inst: inst });
                pc += 4;
                if body.len() >= max_instructions {
                    return Ok(BlockPlan { body: body, ending: Ending::Fallthrough { next: pc } });
                }
            },

            GenResult::Trap { resume } => {
                body.push(Planned { address: pc, inst: inst });
                return Ok(BlockPlan { body: body, ending: Ending::Trap { resume: resume } });
            },

            GenResult::Jump { .. } | GenResult::Branch { .. } | GenResult::JumpRegister => {
                // the delay slot executes with the block; a second control
                // transfer inside it is not translatable
                let delay_address = pc + 4;
                let delay_word = fetch(g.windows, delay_address)?;
                let delay = Decoded::new(delay_word);
                match lookup(&delay)(g, 0, delay_address, &delay) {
                    GenResult::Success => {},
                    _ => return Err(BuildError::Unsupported { address: delay_address, code: delay_word }),
                }

                body.push(Planned { address: pc, inst: inst });
                body.push(Planned { address: delay_address, inst: delay });

                let ending = match outcome {
                    GenResult::Jump { target } => Ending::Jump { target: target },
                    GenResult::Branch { target } => Ending::Branch { target: target, fallthrough: pc + 8 },
                    GenResult::JumpRegister => Ending::Register,
                    _ => unreachable!(),
                };
                return Ok(BlockPlan { body: body, ending: ending });
            },
        }
    }
}

// Pass 1: prologue, instrumented instruction bodies, exit.
#[cfg_attr(not(feature = "listing"), allow(unused_variables))]
fn emit(g: &mut GenContext, address: u32, plan: &BlockPlan, listing_path: Option<&std::path::Path>) {
    #[cfg(feature = "listing")]
    let mut listing = listing_path.and_then(|path| {
        use std::io::Write;
        // truncated on every build
        let mut file = std::fs::File::create(path).ok()?;
        writeln!(file, "Block @ [${:08X}]: ----------------------------------------------------------", address).ok()?;
        Some(file)
    });

    // prologue: pick the context pointer out of the reserved stack slot
    {
        let asm = &mut *g.asm;
        dynasm!(asm
            ; .arch x64
            ; mov rbp, [rsp + 8]
        );
    }

    for p in &plan.body {
        #[cfg(feature = "listing")]
        if let Some(file) = listing.as_mut() {
            use std::io::Write;
            let _ = writeln!(file, "[${:08X}]: {:08X}\t\t{}", p.address, p.inst.v, disassemble(&p.inst, p.address));
        }

        #[cfg(feature = "exec-trace")]
        crate::gen::emit_exec_trace(g.asm, p.address, p.inst.v);

        let outcome = lookup(&p.inst)(g, 1, p.address, &p.inst);
        debug_assert!(outcome != GenResult::Invalid);
    }

    match plan.ending {
        Ending::Fallthrough { next } => {
            emit_jump_site(g, next, true);
        },
        Ending::Jump { target } => {
            emit_jump_site(g, target, true);
        },
        Ending::Branch { target, fallthrough } => {
            let not_taken = {
                let asm = &mut *g.asm;
                let not_taken = asm.new_dynamic_label();
                dynasm!(asm
                    ; .arch x64
                    ; cmp DWORD [rbp + branch_flag_offset()], 0
                    ; jz =>not_taken
                );
                not_taken
            };
            emit_jump_site(g, target, true);
            {
                let asm = &mut *g.asm;
                dynasm!(asm ; .arch x64 ; =>not_taken);
            }
            emit_jump_site(g, fallthrough, true);
        },
        Ending::Register => {
            emit_register_jump(g);
        },
        Ending::Trap { resume } => {
            emit_trap_exit(g, resume);
        },
    }
}

pub struct BlockBuilder {
    ctx: *mut CpuContext,
    windows: Vec<MemoryWindow>,
    cache: CodeCache,
    slots: SlotArena,
    stubs: Stubs,
    breakpoints: Box<MemoryBreakpoints>,
    diagnostics: Box<Diagnostics>,
    stats: JitStats,
    config: Config,
    last_error: Option<BuildError>,
}

impl BlockBuilder {
    /// Boxed so the address baked into generated jump sites stays put.
    pub fn new(ctx: *mut CpuContext, memory: &Memory, config: Config) -> Box<BlockBuilder> {
        Box::new(BlockBuilder {
            ctx: ctx,
            windows: memory.windows().to_vec(),
            cache: CodeCache::new(),
            slots: SlotArena::new(),
            stubs: Stubs::build(),
            breakpoints: Box::new(MemoryBreakpoints::new()),
            diagnostics: Box::new(Diagnostics::new(config.fault_policy)),
            stats: JitStats::new(),
            config: config,
            last_error: None,
        })
    }

    /// Translate the block starting at the given guest address and register
    /// it in the code cache. The address must not already be cached.
    pub fn build(&mut self, address: u32) -> Result<&CodeBlock, BuildError> {
        let address = address & ADDRESS_MASK;

        // re-adding a cached block is a logic error upstream, not a runtime
        // condition
        assert!(self.cache.find(address).is_none(), "duplicate block build at ${:08X}", address);

        #[cfg(feature = "statistics")]
        let build_start = std::time::Instant::now();

        debug!(target: "JIT", "building block at ${:08X}", address);

        let builder_ptr = self as *mut BlockBuilder;
        let listing_path = self.config.listing_path.clone();
        let mut asm = Assembler::new().expect("failed to create assembler");
        let entry = asm.offset();

        let plan;
        {
            let mut g = GenContext {
                asm: &mut asm,
                windows: &self.windows,
                slots: &mut self.slots,
                thunk: self.stubs.thunk,
                dynamic_thunk: self.stubs.dynamic_thunk,
                breakpoints: &*self.breakpoints,
                diagnostics: &*self.diagnostics,
                builder: builder_ptr,
            };

            plan = scan(&mut g, address, self.config.max_block_instructions)?;
            emit(&mut g, address, &plan, listing_path.as_deref());
        }

        let buffer = match asm.finalize() {
            Ok(buffer) => buffer,
            Err(_) => panic!("failed to assemble block at ${:08X}", address),
        };

        let instruction_count = plan.body.len();
        let size = buffer.len();
        let block = self.cache.insert(CodeBlock::new(address, buffer, entry, instruction_count));

        #[cfg(feature = "statistics")]
        {
            self.stats.blocks_generated.inc();
            self.stats.block_length.update(instruction_count as f64);
            self.stats.code_ratio.update(size as f64 / (instruction_count as f64 * 4.0));
            let elapsed = build_start.elapsed().as_secs_f64();
            self.stats.generation_time.update(if elapsed > 0.0 { elapsed } else { 1e-6 });
        }

        trace!(target: "JIT", "block ${:08X}: {} instructions, {} native bytes", address, instruction_count, size);
        Ok(block)
    }

    fn build_ptr(&mut self, address: u32) -> Result<*const u8, BuildError> {
        self.build(address).map(|block| block.code_ptr())
    }

    /// Thunk entry for an unresolved block exit. Recognizes the trap tag,
    /// resolves or builds the target, and patches the slot when allowed.
    pub(crate) fn resolve_slot(&mut self, slot: &JumpSlot) -> *const u8 {
        #[cfg(feature = "statistics")]
        self.stats.thunk_calls.inc();

        let target = slot.target();
        if target & TRAP_ADDRESS != 0 {
            unsafe { (*self.ctx).pc = target & ADDRESS_MASK };
            return self.stubs.exit;
        }

        let code = self.resolve_code(target);
        if slot.fixup() {
            // idempotent: a repeat resolution stores the same pointer again
            slot.patch(code);
        }
        code
    }

    /// Thunk entry for register jumps. The tag is tested before masking so
    /// a tagged link register value exits cleanly.
    pub(crate) fn resolve_target(&mut self, target: u32) -> *const u8 {
        #[cfg(feature = "statistics")]
        self.stats.thunk_calls.inc();

        if target & TRAP_ADDRESS != 0 {
            unsafe { (*self.ctx).pc = target & ADDRESS_MASK };
            return self.stubs.exit;
        }
        self.resolve_code(target & ADDRESS_MASK)
    }

    fn resolve_code(&mut self, target: u32) -> *const u8 {
        match self.cache.quick_lookup(target) {
            Some(code) => {
                #[cfg(feature = "statistics")]
                self.stats.thunk_hits.inc();
                code
            },
            None => {
                #[cfg(feature = "statistics")]
                self.stats.thunk_builds.inc();
                match self.build_ptr(target) {
                    Ok(code) => code,
                    Err(error) => {
                        // surface the error at the next trap exit; generated
                        // code cannot be unwound from here
                        error!(target: "JIT", "build failed at ${:08X}: {:?}", target, error);
                        self.last_error = Some(error);
                        unsafe { (*self.ctx).pc = target };
                        self.stubs.exit
                    },
                }
            },
        }
    }

    /// The bounce trampoline, the only way into generated code. Callers
    /// must drop every borrow of the builder before invoking it: the thunk
    /// re-enters through the pointer baked into the jump sites.
    pub(crate) fn bounce_fn(&self) -> BounceFn {
        self.stubs.bounce
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn slots(&self) -> &SlotArena {
        &self.slots
    }

    pub fn breakpoints(&self) -> &MemoryBreakpoints {
        &self.breakpoints
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub fn take_error(&mut self) -> Option<BuildError> {
        self.last_error.take()
    }
}

#[cfg(feature = "listing")]
fn disassemble(i: &Decoded, address: u32) -> String {
    match i.op {
        0 => match i.funct {
            0x00 if i.v == 0 => format!("nop"),
            0x00 => format!("sll r{}, r{}, {}", i.rd, i.rt, i.sa),
            0x02 => format!("srl r{}, r{}, {}", i.rd, i.rt, i.sa),
            0x03 => format!("sra r{}, r{}, {}", i.rd, i.rt, i.sa),
            0x04 => format!("sllv r{}, r{}, r{}", i.rd, i.rt, i.rs),
            0x06 => format!("srlv r{}, r{}, r{}", i.rd, i.rt, i.rs),
            0x07 => format!("srav r{}, r{}, r{}", i.rd, i.rt, i.rs),
            0x08 => format!("jr r{}", i.rs),
            0x09 => format!("jalr r{}, r{}", i.rd, i.rs),
            0x0C => format!("syscall"),
            0x0D => format!("break"),
            0x21 => format!("addu r{}, r{}, r{}", i.rd, i.rs, i.rt),
            0x23 => format!("subu r{}, r{}, r{}", i.rd, i.rs, i.rt),
            0x24 => format!("and r{}, r{}, r{}", i.rd, i.rs, i.rt),
            0x25 => format!("or r{}, r{}, r{}", i.rd, i.rs, i.rt),
            0x26 => format!("xor r{}, r{}, r{}", i.rd, i.rs, i.rt),
            0x27 => format!("nor r{}, r{}, r{}", i.rd, i.rs, i.rt),
            0x2A => format!("slt r{}, r{}, r{}", i.rd, i.rs, i.rt),
            0x2B => format!("sltu r{}, r{}, r{}", i.rd, i.rs, i.rt),
            _ => format!("<special {:02X}>", i.funct),
        },
        0x02 => format!("j ${:08X}", (address.wrapping_add(4) & 0xF000_0000) | (i.target << 2)),
        0x03 => format!("jal ${:08X}", (address.wrapping_add(4) & 0xF000_0000) | (i.target << 2)),
        0x04 => format!("beq r{}, r{}, ${:04X}", i.rs, i.rt, i.imm),
        0x05 => format!("bne r{}, r{}, ${:04X}", i.rs, i.rt, i.imm),
        0x06 => format!("blez r{}, ${:04X}", i.rs, i.imm),
        0x07 => format!("bgtz r{}, ${:04X}", i.rs, i.imm),
        0x08 => format!("addi r{}, r{}, ${:04X}", i.rt, i.rs, i.imm),
        0x09 => format!("addiu r{}, r{}, ${:04X}", i.rt, i.rs, i.imm),
        0x0A => format!("slti r{}, r{}, ${:04X}", i.rt, i.rs, i.imm),
        0x0B => format!("sltiu r{}, r{}, ${:04X}", i.rt, i.rs, i.imm),
        0x0C => format!("andi r{}, r{}, ${:04X}", i.rt, i.rs, i.imm),
        0x0D => format!("ori r{}, r{}, ${:04X}", i.rt, i.rs, i.imm),
        0x0E => format!("xori r{}, r{}, ${:04X}", i.rt, i.rs, i.imm),
        0x0F => format!("lui r{}, ${:04X}", i.rt, i.imm),
        0x20 => format!("lb r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x21 => format!("lh r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x22 => format!("lwl r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x23 => format!("lw r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x24 => format!("lbu r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x25 => format!("lhu r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x26 => format!("lwr r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x28 => format!("sb r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x29 => format!("sh r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x2A => format!("swl r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x2B => format!("sw r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x2E => format!("swr r{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x2F => format!("cache ${:02X}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x31 => format!("lwc1 f{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        0x39 => format!("swc1 f{}, ${:04X}(r{})", i.rt, i.imm, i.rs),
        _ => format!("<op {:02X}>", i.op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_extracts_fields() {
        // lw r8, 0x0010(r4)
        let i = Decoded::new((0x23 << 26) | (4 << 21) | (8 << 16) | 0x0010);
        assert_eq!(i.op, 0x23);
        assert_eq!(i.rs, 4);
        assert_eq!(i.rt, 8);
        assert_eq!(i.imm, 0x0010);

        // addu r3, r1, r2
        let i = Decoded::new((1 << 21) | (2 << 16) | (3 << 11) | 0x21);
        assert_eq!(i.op, 0);
        assert_eq!(i.funct, 0x21);
        assert_eq!(i.rs, 1);
        assert_eq!(i.rt, 2);
        assert_eq!(i.rd, 3);
    }
}

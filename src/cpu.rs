#[allow(unused_imports)]
use tracing::{trace, debug, error, warn, info};

use crate::ADDRESS_MASK;
use crate::Config;
use crate::builder::{BlockBuilder, BuildError};
use crate::breakpoints::MemoryBreakpoints;
use crate::mem::{Diagnostics, Memory};
use crate::stats::JitStats;

/// Guest CPU state with a fixed layout. Generated code addresses these
/// fields by constant offsets, so the struct is repr(C) and lives behind a
/// Box for a stable address. The branch/jump latch words hold the condition
/// or target captured before a delay slot instruction executes.
#[repr(C)]
pub struct CpuContext {
    pub pc: u32,
    pub branch_flag: u32,
    pub jump_target: u32,
    pub hi: u32,
    pub lo: u32,
    pub registers: [u32; 32],
    pub cp1_condition: u32,
    pub cp1_registers: [u32; 32],
    pub cp2_condition: u32,
    pub cp2_registers: [u32; 128],
}

impl CpuContext {
    pub fn new() -> CpuContext {
        CpuContext {
            pc: 0,
            branch_flag: 0,
            jump_target: 0,
            hi: 0,
            lo: 0,
            registers: [0u32; 32],
            cp1_condition: 0,
            cp1_registers: [0u32; 32],
            cp2_condition: 0,
            cp2_registers: [0u32; 128],
        }
    }
}

// conventional register names, indexed by register number
const ABI_NAMES: [&str; 32] = [
    "r0", "at", "v0", "v1", "a0", "a1", "a2", "a3",
    "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7",
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7",
    "t8", "t9", "k0", "k1", "gp", "sp", "fp", "ra",
];

pub fn abi_name(register: usize) -> &'static str {
    ABI_NAMES[register]
}

/// The translated guest CPU: context, physical memory and the block builder.
pub struct Cpu {
    ctx: Box<CpuContext>,
    memory: Memory,
    builder: Box<BlockBuilder>,
}

impl Cpu {
    pub fn new(memory: Memory, config: Config) -> Cpu {
        let mut ctx = Box::new(CpuContext::new());
        let ctx_ptr: *mut CpuContext = &mut *ctx;
        let builder = BlockBuilder::new(ctx_ptr, &memory, config);

        Cpu {
            ctx: ctx,
            memory: memory,
            builder: builder,
        }
    }

    /// Run generated code starting at the given guest address until the
    /// guest traps back out. Returns the trap pc. Blocks are built on
    /// demand, both here and from the missing-block thunk while native code
    /// is running.
    pub fn run(&mut self, entry: u32) -> Result<u32, BuildError> {
        let entry = entry & ADDRESS_MASK;

        let code = match self.builder.cache().quick_lookup(entry) {
            Some(code) => code,
            None => self.builder.build(entry)?.code_ptr(),
        };

        trace!(target: "CPU", "entering generated code at ${:08X}", entry);
        // no borrow of the builder may be live while native code runs; the
        // thunk re-enters it through its baked-in pointer
        let bounce = self.builder.bounce_fn();
        let ctx_ptr: *mut CpuContext = &mut *self.ctx;
        unsafe { bounce(code, ctx_ptr) };

        if let Some(error) = self.builder.take_error() {
            return Err(error);
        }
        Ok(self.ctx.pc)
    }

    pub fn context(&self) -> &CpuContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut CpuContext {
        &mut self.ctx
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn builder(&self) -> &BlockBuilder {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut BlockBuilder {
        &mut self.builder
    }

    pub fn breakpoints(&self) -> &MemoryBreakpoints {
        self.builder.breakpoints()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        self.builder.diagnostics()
    }

    pub fn stats(&self) -> &JitStats {
        self.builder.stats()
    }
}

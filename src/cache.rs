#[allow(unused_imports)]
use tracing::{trace, debug, error, warn, info};

use std::collections::HashMap;

use dynasmrt::{AssemblyOffset, ExecutableBuffer};

/// One contiguous run of guest instructions translated into one native code
/// unit. Owns its executable buffer; blocks are never mutated once built
/// (the cross-block link lives in a jump slot, not in the block).
pub struct CodeBlock {
    address: u32,
    buffer: ExecutableBuffer,
    entry: AssemblyOffset,
    instruction_count: usize,
}

impl CodeBlock {
    pub(crate) fn new(address: u32, buffer: ExecutableBuffer, entry: AssemblyOffset, instruction_count: usize) -> CodeBlock {
        CodeBlock {
            address: address,
            buffer: buffer,
            entry: entry,
            instruction_count: instruction_count,
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    /// Entry point, callable under the internal calling convention only
    /// (enter through the bounce trampoline).
    pub fn code_ptr(&self) -> *const u8 {
        self.buffer.ptr(self.entry)
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }
}

/// Translated blocks keyed by masked guest address, plus a raw-pointer map
/// the thunk consults first so the hot path never touches a CodeBlock.
pub struct CodeCache {
    blocks: HashMap<u32, CodeBlock>,
    quick: HashMap<u32, usize>,
}

impl CodeCache {
    pub fn new() -> CodeCache {
        CodeCache {
            blocks: HashMap::new(),
            quick: HashMap::new(),
        }
    }

    pub fn find(&self, address: u32) -> Option<&CodeBlock> {
        self.blocks.get(&address)
    }

    pub fn quick_lookup(&self, address: u32) -> Option<*const u8> {
        self.quick.get(&address).map(|p| *p as *const u8)
    }

    pub fn insert(&mut self, block: CodeBlock) -> &CodeBlock {
        let address = block.address();
        assert!(!self.blocks.contains_key(&address), "duplicate code block at ${:08X}", address);

        self.quick.insert(address, block.code_ptr() as usize);
        self.blocks.entry(address).or_insert(block)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynasmrt::{dynasm, DynasmApi};

    fn dummy_block(address: u32) -> CodeBlock {
        let mut asm = dynasmrt::x64::Assembler::new().unwrap();
        let entry = asm.offset();
        dynasm!(asm ; .arch x64 ; ret);
        let buffer = match asm.finalize() {
            Ok(buffer) => buffer,
            Err(_) => panic!("failed to assemble"),
        };
        CodeBlock::new(address, buffer, entry, 1)
    }

    #[test]
    fn insert_and_find() {
        let mut cache = CodeCache::new();
        assert!(cache.find(0x0800_0000).is_none());
        assert!(cache.quick_lookup(0x0800_0000).is_none());

        cache.insert(dummy_block(0x0800_0000));
        let block = cache.find(0x0800_0000).unwrap();
        assert_eq!(block.address(), 0x0800_0000);
        assert_eq!(cache.quick_lookup(0x0800_0000), Some(block.code_ptr()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    #[should_panic(expected = "duplicate code block")]
    fn duplicate_insert_panics() {
        let mut cache = CodeCache::new();
        cache.insert(dummy_block(0x0800_0000));
        cache.insert(dummy_block(0x0800_0000));
    }
}

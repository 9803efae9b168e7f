//! Basic-block discovery.
//!
//! A block starts at offset zero, at every branch and `switch` target, after every instruction
//! that ends a block, and at every boundary of a protected region, handler or filter. The scan
//! also rejects control transfers the lowering cannot express: targets that are not instruction
//! boundaries, and jumps from outside a protected region or handler into its middle.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::{
    codegen::stack::StackShape,
    il::{FlowType, Instruction},
    metadata::method::{ExceptionRegion, ExceptionRegionKind},
    Result,
};

bitflags! {
    /// Why a block starts where it does.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockFlags: u8 {
        /// Target of a branch, `switch` or `leave`
        const BRANCH_TARGET = 0x01;
        /// First block of a protected region
        const TRY_START = 0x02;
        /// First block of a handler
        const HANDLER_START = 0x04;
        /// First block of a filter
        const FILTER_START = 0x08;
    }
}

/// Import progress of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// No path into the block has been imported yet
    Unreached,
    /// A predecessor fixed the entry stack, the block waits to be imported
    Reached,
    /// The block's instructions are being imported
    Importing,
    /// The block has been imported
    Closed,
}

/// A maximal straight-line run of instructions.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// IL offset of the first instruction
    pub start: u32,
    /// IL offset just past the last instruction
    pub end: u32,
    /// Index of the first instruction in the decoded stream
    pub first: usize,
    /// Index just past the last instruction
    pub last: usize,
    /// Start reasons
    pub flags: BlockFlags,
    /// Import progress
    pub state: BlockState,
    /// Stack shape every predecessor must leave behind, fixed by the first one imported
    pub entry_stack: Option<Vec<StackShape>>,
}

impl BasicBlock {
    /// Label of the block in generated code.
    #[must_use]
    pub fn label(&self) -> String {
        format!("_bb{}", self.start)
    }
}

/// Blocks of one method body in layout order.
#[derive(Debug, Clone)]
pub struct BlockGraph {
    blocks: Vec<BasicBlock>,
    by_offset: BTreeMap<u32, usize>,
}

impl BlockGraph {
    /// Blocks in layout order.
    #[must_use]
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    /// Mutable access to one block.
    pub fn block_mut(&mut self, index: usize) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(index)
    }

    /// Index of the block starting at `offset`.
    #[must_use]
    pub fn index_at(&self, offset: u32) -> Option<usize> {
        self.by_offset.get(&offset).copied()
    }

    /// The block starting at `offset`.
    #[must_use]
    pub fn block_at(&self, offset: u32) -> Option<&BasicBlock> {
        self.index_at(offset).and_then(|index| self.blocks.get(index))
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// `true` for an empty body.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

fn check_region(region: &ExceptionRegion, code_len: u32) -> Result<()> {
    let try_end = region.try_offset.checked_add(region.try_length);
    let handler_end = region.handler_offset.checked_add(region.handler_length);
    match (try_end, handler_end) {
        (Some(try_end), Some(handler_end)) if try_end <= code_len && handler_end <= code_len => {}
        _ => {
            return Err(malformed_error!(
                "Exception region {:#x}+{:#x} / {:#x}+{:#x} exceeds the {} byte body",
                region.try_offset,
                region.try_length,
                region.handler_offset,
                region.handler_length,
                code_len
            ))
        }
    }
    if let ExceptionRegionKind::Filter(filter) = region.kind {
        if filter >= region.handler_offset {
            return Err(malformed_error!(
                "Filter at {:#x} does not precede its handler at {:#x}",
                filter,
                region.handler_offset
            ));
        }
    }
    Ok(())
}

fn handler_entry(region: &ExceptionRegion) -> u32 {
    match region.kind {
        ExceptionRegionKind::Filter(filter) => filter,
        _ => region.handler_offset,
    }
}

/// Reject a transfer from `source` to `target` that enters a region other than at its start.
fn check_transfer(regions: &[ExceptionRegion], source: u32, target: u32) -> Result<()> {
    for region in regions {
        if region.try_contains(target) && !region.try_contains(source) && target != region.try_offset {
            return Err(malformed_error!(
                "IL_{:04x} jumps into the middle of the protected region at IL_{:04x}",
                source,
                region.try_offset
            ));
        }
        if region.handler_contains(target) && !region.handler_contains(source) {
            return Err(malformed_error!(
                "IL_{:04x} jumps into the handler at IL_{:04x}",
                source,
                handler_entry(region)
            ));
        }
    }
    Ok(())
}

/// Split a decoded body into basic blocks.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for branch targets that are not instruction boundaries
/// inside the body, exception regions that do not fit the body, and jumps into the middle of a
/// protected region or handler.
pub fn find_blocks(
    instructions: &[Instruction],
    code_len: u32,
    regions: &[ExceptionRegion],
) -> Result<BlockGraph> {
    let boundaries: BTreeMap<u32, usize> = instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| (instruction.offset, index))
        .collect();

    let mut starts: BTreeMap<u32, BlockFlags> = BTreeMap::new();
    if !instructions.is_empty() {
        starts.insert(0, BlockFlags::empty());
    }

    for instruction in instructions {
        for target in instruction.branch_targets() {
            if *target >= code_len || !boundaries.contains_key(target) {
                return Err(malformed_error!(
                    "Branch target IL_{:04x} of IL_{:04x} is not an instruction in the {} byte body",
                    target,
                    instruction.offset,
                    code_len
                ));
            }
            check_transfer(regions, instruction.offset, *target)?;
            *starts.entry(*target).or_default() |= BlockFlags::BRANCH_TARGET;
        }

        let flow = instruction.opcode.flow();
        let splits = flow.ends_block() || matches!(flow, FlowType::ConditionalBranch | FlowType::Switch);
        if splits && instruction.next_offset() < code_len {
            starts.entry(instruction.next_offset()).or_default();
        }
    }

    for region in regions {
        check_region(region, code_len)?;
        *starts.entry(region.try_offset).or_default() |= BlockFlags::TRY_START;
        *starts.entry(region.handler_offset).or_default() |= BlockFlags::HANDLER_START;
        if let ExceptionRegionKind::Filter(filter) = region.kind {
            *starts.entry(filter).or_default() |= BlockFlags::FILTER_START;
        }
        for end in [region.try_offset + region.try_length, region.handler_offset + region.handler_length] {
            if end < code_len {
                starts.entry(end).or_default();
            }
        }
    }

    let mut blocks = Vec::with_capacity(starts.len());
    let mut by_offset = BTreeMap::new();
    let offsets: Vec<(u32, BlockFlags)> = starts.into_iter().collect();
    for (position, (start, flags)) in offsets.iter().enumerate() {
        let Some(first) = boundaries.get(start).copied() else {
            return Err(malformed_error!(
                "Exception region boundary IL_{:04x} is not an instruction boundary",
                start
            ));
        };
        let last = match offsets.get(position + 1) {
            Some((next, _)) => boundaries.get(next).copied().unwrap_or(instructions.len()),
            None => instructions.len(),
        };
        let end = instructions
            .get(last.saturating_sub(1))
            .map_or(*start, Instruction::next_offset);
        by_offset.insert(*start, blocks.len());
        blocks.push(BasicBlock {
            start: *start,
            end,
            first,
            last,
            flags: *flags,
            state: BlockState::Unreached,
            entry_stack: None,
        });
    }

    Ok(BlockGraph { blocks, by_offset })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{il::decode_stream, metadata::method::ExceptionHandlerFlags};

    #[test]
    fn conditional_branch_splits() {
        // ldarg.0; brfalse.s +2; ldc.i4.1; ret; ldc.i4.0; ret
        let code = [0x02, 0x2C, 0x02, 0x17, 0x2A, 0x16, 0x2A];
        let instructions = decode_stream(&code).unwrap();
        let graph = find_blocks(&instructions, code.len() as u32, &[]).unwrap();
        let starts: Vec<u32> = graph.blocks().iter().map(|block| block.start).collect();
        assert_eq!(starts, vec![0, 3, 5]);
        assert!(graph.block_at(5).unwrap().flags.contains(BlockFlags::BRANCH_TARGET));
        assert_eq!(graph.block_at(3).unwrap().end, 5);
        assert_eq!(graph.blocks()[0].label(), "_bb0");
    }

    #[test]
    fn branch_past_end_is_malformed() {
        // br.s +16
        let code = [0x2B, 0x10];
        let instructions = decode_stream(&code).unwrap();
        assert!(matches!(
            find_blocks(&instructions, code.len() as u32, &[]),
            Err(crate::Error::Malformed { .. })
        ));
    }

    #[test]
    fn jump_into_protected_region_is_rejected() {
        // 0: br.s 3; 2: nop; 3: nop; 4: leave.s 9; 6: pop; 7: leave.s 9; 9: ret
        let code = [0x2B, 0x01, 0x00, 0x00, 0xDE, 0x03, 0x26, 0xDE, 0x00, 0x2A];
        let instructions = decode_stream(&code).unwrap();
        let finally = ExceptionRegion::from_raw(ExceptionHandlerFlags::FINALLY, 2, 4, 6, 3, 0);
        assert!(find_blocks(&instructions, code.len() as u32, &[finally]).is_err());

        let catch = ExceptionRegion::from_raw(ExceptionHandlerFlags::EXCEPTION, 3, 3, 6, 3, 0x0100_0001);
        let graph = find_blocks(&instructions, code.len() as u32, &[catch]).unwrap();
        assert!(graph.block_at(3).unwrap().flags.contains(BlockFlags::TRY_START));
        assert!(graph.block_at(6).unwrap().flags.contains(BlockFlags::HANDLER_START));
        assert!(graph.block_at(9).unwrap().flags.contains(BlockFlags::BRANCH_TARGET));
    }
}

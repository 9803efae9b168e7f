//! Exception-handling clauses of a method body.

use bitflags::bitflags;

use crate::metadata::token::Token;

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause.
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause.
        const FILTER = 0x0001;
        /// A finally clause.
        const FINALLY = 0x0002;
        /// A fault clause (finally that executes only on exception).
        const FAULT = 0x0004;
    }
}

/// What a protected region hands control to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionRegionKind {
    /// `catch (T)` where `T` is the referenced type token
    Catch(Token),
    /// Filter block starting at the given IL offset, followed by the handler
    Filter(u32),
    /// `finally`
    Finally,
    /// `fault`
    Fault,
}

/// One protected region and its handler, with offsets relative to the first IL byte.
///
/// ```text
/// try {                 // try_offset .. try_offset + try_length
/// } catch / finally {   // handler_offset .. handler_offset + handler_length
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRegion {
    /// Kind of handler
    pub kind: ExceptionRegionKind,
    /// Offset in bytes of try block from start of method body
    pub try_offset: u32,
    /// Length in bytes of the try block
    pub try_length: u32,
    /// Location of the handler for this try block
    pub handler_offset: u32,
    /// Size of the handler code in bytes
    pub handler_length: u32,
}

impl ExceptionRegion {
    /// Builds a region from the raw clause fields; `class_or_filter` is the class token for
    /// typed clauses and the filter offset for filter clauses.
    #[must_use]
    pub fn from_raw(
        flags: ExceptionHandlerFlags,
        try_offset: u32,
        try_length: u32,
        handler_offset: u32,
        handler_length: u32,
        class_or_filter: u32,
    ) -> Self {
        let kind = if flags.contains(ExceptionHandlerFlags::FILTER) {
            ExceptionRegionKind::Filter(class_or_filter)
        } else if flags.contains(ExceptionHandlerFlags::FINALLY) {
            ExceptionRegionKind::Finally
        } else if flags.contains(ExceptionHandlerFlags::FAULT) {
            ExceptionRegionKind::Fault
        } else {
            ExceptionRegionKind::Catch(Token(class_or_filter))
        };

        ExceptionRegion {
            kind,
            try_offset,
            try_length,
            handler_offset,
            handler_length,
        }
    }

    /// Raw flag and class/filter words for re-encoding.
    #[must_use]
    pub fn raw_parts(&self) -> (ExceptionHandlerFlags, u32) {
        match self.kind {
            ExceptionRegionKind::Catch(token) => (ExceptionHandlerFlags::EXCEPTION, token.value()),
            ExceptionRegionKind::Filter(offset) => (ExceptionHandlerFlags::FILTER, offset),
            ExceptionRegionKind::Finally => (ExceptionHandlerFlags::FINALLY, 0),
            ExceptionRegionKind::Fault => (ExceptionHandlerFlags::FAULT, 0),
        }
    }

    /// `true` if `offset` lies inside the protected range.
    #[must_use]
    pub fn try_contains(&self, offset: u32) -> bool {
        offset >= self.try_offset && offset - self.try_offset < self.try_length
    }

    /// `true` if `offset` lies inside the handler (or, for filters, the filter block).
    #[must_use]
    pub fn handler_contains(&self, offset: u32) -> bool {
        let in_handler =
            offset >= self.handler_offset && offset - self.handler_offset < self.handler_length;
        match self.kind {
            ExceptionRegionKind::Filter(filter) => {
                in_handler || (offset >= filter && offset < self.handler_offset)
            }
            _ => in_handler,
        }
    }

    /// `true` if the handler receives the exception object on its entry stack.
    #[must_use]
    pub fn handler_takes_exception(&self) -> bool {
        matches!(
            self.kind,
            ExceptionRegionKind::Catch(_) | ExceptionRegionKind::Filter(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_flags() {
        let catch = ExceptionRegion::from_raw(ExceptionHandlerFlags::EXCEPTION, 0, 4, 4, 2, 0x0100_0003);
        assert_eq!(catch.kind, ExceptionRegionKind::Catch(Token(0x0100_0003)));
        let finally = ExceptionRegion::from_raw(ExceptionHandlerFlags::FINALLY, 0, 4, 4, 2, 0);
        assert_eq!(finally.kind, ExceptionRegionKind::Finally);
        assert!(!finally.handler_takes_exception());
    }

    #[test]
    fn filter_block_counts_as_handler() {
        let region = ExceptionRegion::from_raw(ExceptionHandlerFlags::FILTER, 0, 10, 20, 5, 14);
        assert!(region.try_contains(9));
        assert!(!region.try_contains(10));
        assert!(region.handler_contains(14));
        assert!(region.handler_contains(24));
        assert!(!region.handler_contains(25));
        assert!(!region.handler_contains(13));
    }
}

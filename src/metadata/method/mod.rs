//! Method bodies as stored in the metadata: header, IL bytes and exception clauses.

mod body;
mod exceptions;

pub use body::{MethodBody, MethodBodyFlags, SectionFlags};
pub use exceptions::{ExceptionHandlerFlags, ExceptionRegion, ExceptionRegionKind};

use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! unsupported {
    ($($arg:tt)*) => {
        crate::Error::UnsupportedConstruct(format!($($arg)*))
    };
}

macro_rules! missing_metadata {
    ($($arg:tt)*) => {
        crate::Error::MissingMetadata(format!($($arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into two groups. Errors tied to a single method body (malformed IL,
/// inconsistent evaluation stacks, constructs the backend cannot lower, unresolvable metadata)
/// are caught at the method-compilation boundary and turned into a trap stub for that method.
/// Everything else (I/O, object-file emission, verification of the produced artifact) aborts the
/// whole compilation.
///
/// # Error Categories
///
/// ## Method-local Errors
/// - [`Error::Malformed`] - IL body could not be decoded or references an invalid token/target
/// - [`Error::OutOfBounds`] - A read ran past the end of a buffer
/// - [`Error::StackMergeConflict`] - Two control-flow paths disagree on the evaluation stack
/// - [`Error::UnsupportedConstruct`] - A construct the backend does not lower
/// - [`Error::MissingMetadata`] - A referenced entity could not be resolved
/// - [`Error::InvalidGenericInstantiation`] - Arity mismatch or illegal type argument
///
/// ## Output Errors
/// - [`Error::RelocationResolution`] - A relocation target could not be bound
/// - [`Error::Verification`] - The written artifact failed its structural check
/// - [`Error::ObjectWrite`] - The object-file writer rejected the emitted sections
/// - [`Error::GoblinErr`] - The produced object file could not be parsed back
/// - [`Error::FileError`] - Filesystem I/O errors
///
/// # Examples
///
/// ```rust
/// use cilaot::Error;
///
/// let err = Error::UnsupportedConstruct("jmp".to_string());
/// assert!(err.is_method_local());
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The IL body or one of its tables is damaged.
    ///
    /// Raised when decoding runs into an invalid opcode, an operand references something that
    /// does not exist, or a branch leaves the method. The error includes the source location
    /// where the malformation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading a buffer.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// Two control-flow paths reach the same basic block with differently shaped stacks.
    ///
    /// The block's entry stack is fixed by the first path that reaches it; every other
    /// predecessor must produce the same depth, the same kind per slot and the same value type
    /// for value-type slots.
    #[error("Stack merge conflict at IL_{offset:04x}: {message}")]
    StackMergeConflict {
        /// IL offset of the block whose entry stack was violated
        offset: u32,
        /// Description of the mismatch
        message: String,
    },

    /// The backend does not know how to lower this construct.
    #[error("Unsupported construct: {0}")]
    UnsupportedConstruct(String),

    /// A referenced type, method or field could not be resolved from the metadata store.
    #[error("Missing metadata: {0}")]
    MissingMetadata(String),

    /// A generic instantiation was requested with the wrong arity or an illegal argument.
    #[error("Invalid generic instantiation: {0}")]
    InvalidGenericInstantiation(String),

    /// A symbol reference could not be resolved while writing output.
    #[error("Relocation resolution failed: {0}")]
    RelocationResolution(String),

    /// The produced artifact failed its structural check.
    #[error("Output verification failed: {0}")]
    Verification(String),

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate while parsing back the produced object file.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Error from the object crate while serializing sections, symbols and relocations.
    #[error("{0}")]
    ObjectWrite(#[from] object::write::Error),
}

impl Error {
    /// Returns `true` if this error only invalidates the method being compiled.
    ///
    /// Such failures are converted into a trap stub by the compilation driver; all other errors
    /// abort the run.
    #[must_use]
    pub fn is_method_local(&self) -> bool {
        matches!(
            self,
            Error::Malformed { .. }
                | Error::OutOfBounds
                | Error::StackMergeConflict { .. }
                | Error::UnsupportedConstruct(_)
                | Error::MissingMetadata(_)
                | Error::InvalidGenericInstantiation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_macro_captures_location() {
        let err = malformed_error!("bad opcode {}", 0xA6);
        match err {
            Error::Malformed { message, file, .. } => {
                assert_eq!(message, "bad opcode 166");
                assert!(file.ends_with("error.rs"));
            }
            _ => panic!("expected Malformed"),
        }
    }

    #[test]
    fn method_local_classification() {
        assert!(Error::OutOfBounds.is_method_local());
        assert!(unsupported!("jmp").is_method_local());
        assert!(missing_metadata!("type {}", "Foo").is_method_local());
        assert!(!Error::Verification("no symbols".into()).is_method_local());
    }
}

//! Indenting text accumulator for generated source.

use std::fmt::{self, Write};

/// A growable text buffer that tracks the indentation of the lines it is given.
///
/// Lines are started with [`CppBuffer::append_line`], which emits the newline followed by the
/// current indentation, so a block looks like:
///
/// ```rust
/// use cilaot::codegen::CppBuffer;
///
/// let mut buffer = CppBuffer::new();
/// buffer.append("int main() {");
/// buffer.indent();
/// buffer.append_line();
/// buffer.append("return 0;");
/// buffer.exdent();
/// buffer.append_line();
/// buffer.append("}");
/// assert_eq!(buffer.as_str(), "int main() {\n    return 0;\n}");
/// ```
#[derive(Debug, Default, Clone)]
pub struct CppBuffer {
    text: String,
    indent: usize,
}

impl CppBuffer {
    /// An empty buffer at indentation zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text to the current line.
    pub fn append(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Append formatted text to the current line.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) {
        // writing into a String cannot fail
        let _ = self.text.write_fmt(args);
    }

    /// Start a new line at the current indentation.
    pub fn append_line(&mut self) {
        self.text.push('\n');
        for _ in 0..self.indent {
            self.text.push_str("    ");
        }
    }

    /// Emit a blank line and start the next one at column zero.
    pub fn append_empty_line(&mut self) {
        self.text.push('\n');
    }

    /// Increase the indentation of subsequent lines.
    pub fn indent(&mut self) {
        self.indent += 1;
    }

    /// Decrease the indentation of subsequent lines.
    pub fn exdent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    /// `true` if nothing was appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The accumulated text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Take the accumulated text.
    #[must_use]
    pub fn into_string(self) -> String {
        self.text
    }
}

impl fmt::Display for CppBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exdent_saturates() {
        let mut buffer = CppBuffer::new();
        buffer.exdent();
        buffer.append("a");
        buffer.append_line();
        buffer.append_fmt(format_args!("{}", 1));
        assert_eq!(buffer.as_str(), "a\n1");
    }
}

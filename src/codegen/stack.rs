//! The abstract evaluation stack.
//!
//! Every IL value the lowering engine tracks is a [`StackEntry`]: a constant, a rendered
//! expression, the address of an lvalue, a method entry point, a deferred load of a local or
//! argument, or a spill slot that carries a value across a block boundary. Each entry has a
//! [`StackValueKind`], and the kinds are totally ordered so that binary operators can pick the
//! wider operand.

use std::fmt;

use crate::{
    codegen::ctypes,
    typesystem::{MethodId, TypeCategory, TypeId, TypeKey, TypeSystemContext},
    Result,
};

/// Classification of a stack value, ordered from narrowest to widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StackValueKind {
    /// 32-bit integer, also booleans and characters
    Int32,
    /// 64-bit integer
    Int64,
    /// Pointer-sized integer, unmanaged pointers
    NativeInt,
    /// Managed pointer
    ByRef,
    /// Object reference
    ObjRef,
    /// Floating point
    Float,
    /// Value type instance
    ValueType,
}

impl StackValueKind {
    /// The stack kind a value of `ty` takes when pushed.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedConstruct`] for open generic types and
    /// [`crate::Error::Malformed`] for `void`.
    pub fn of(ctx: &TypeSystemContext, ty: TypeId) -> Result<Self> {
        let desc = ctx.type_desc(ty);
        match &desc.key {
            TypeKey::Primitive(kind) => {
                use crate::typesystem::PrimitiveKind as P;
                match kind {
                    P::Void => Err(malformed_error!("void has no stack representation")),
                    P::I8 | P::U8 => Ok(StackValueKind::Int64),
                    P::R4 | P::R8 => Ok(StackValueKind::Float),
                    P::I | P::U => Ok(StackValueKind::NativeInt),
                    _ => Ok(StackValueKind::Int32),
                }
            }
            TypeKey::ByRef(_) => Ok(StackValueKind::ByRef),
            TypeKey::Pointer(_) | TypeKey::FunctionPointer(_) => Ok(StackValueKind::NativeInt),
            TypeKey::GenericParameter(..) | TypeKey::UniversalCanon => {
                Err(unsupported!("open type {} on the evaluation stack", ctx.type_name(ty)))
            }
            _ => match desc.category {
                TypeCategory::Enum => Self::of(ctx, ctx.enum_underlying_type(ty)?),
                TypeCategory::ValueType | TypeCategory::Primitive => Ok(StackValueKind::ValueType),
                _ => Ok(StackValueKind::ObjRef),
            },
        }
    }

    /// The result kind of a binary arithmetic operator: the wider operand wins.
    #[must_use]
    pub fn widen(self, other: StackValueKind) -> StackValueKind {
        self.max(other)
    }

    /// C++ type used for temporaries of this kind; value types need their own name.
    #[must_use]
    pub fn cpp_type(self) -> &'static str {
        match self {
            StackValueKind::Int32 => "int32_t",
            StackValueKind::Int64 => "int64_t",
            StackValueKind::NativeInt => "intptr_t",
            StackValueKind::ByRef | StackValueKind::ObjRef => "void*",
            StackValueKind::Float => "double",
            StackValueKind::ValueType => "",
        }
    }
}

/// One value on the evaluation stack.
#[derive(Debug, Clone, PartialEq)]
pub enum StackEntry {
    /// `ldc.i4` and friends
    Int32Const(i32),
    /// `ldc.i8`
    Int64Const(i64),
    /// `ldc.r4` / `ldc.r8`; `single` keeps the bit pattern of the 32-bit form
    FloatConst {
        /// The value
        value: f64,
        /// Loaded by `ldc.r4`
        single: bool,
    },
    /// A rendered C++ expression
    Expression {
        /// Stack kind
        kind: StackValueKind,
        /// Rendered expression, always side-effect free
        text: String,
        /// Managed type, when known
        ty: Option<TypeId>,
    },
    /// The address of an lvalue, kind [`StackValueKind::ByRef`]
    AddressOf {
        /// The lvalue
        lvalue: String,
        /// Managed type of the lvalue
        ty: Option<TypeId>,
    },
    /// Code address of a method, kind [`StackValueKind::NativeInt`]
    FunctionPointer {
        /// The method
        method: MethodId,
        /// Resolved through the object's method table
        is_virtual: bool,
        /// Rendered address
        text: String,
    },
    /// A local or argument read lazily, so stores to the variable must materialize it first
    Load {
        /// Stack kind
        kind: StackValueKind,
        /// Variable name
        variable: String,
        /// Managed type of the variable
        ty: Option<TypeId>,
    },
    /// A value carried across a block boundary in a named slot
    Spilled {
        /// Stack kind
        kind: StackValueKind,
        /// Slot name
        name: String,
        /// Managed type, when known
        ty: Option<TypeId>,
    },
}

impl StackEntry {
    /// An expression entry of a known managed type.
    pub fn typed(ctx: &TypeSystemContext, text: String, ty: TypeId) -> Result<Self> {
        Ok(StackEntry::Expression {
            kind: StackValueKind::of(ctx, ty)?,
            text,
            ty: Some(ty),
        })
    }

    /// An expression entry of a bare kind.
    #[must_use]
    pub fn expression(kind: StackValueKind, text: impl Into<String>) -> Self {
        StackEntry::Expression {
            kind,
            text: text.into(),
            ty: None,
        }
    }

    /// The stack kind.
    #[must_use]
    pub fn kind(&self) -> StackValueKind {
        match self {
            StackEntry::Int32Const(_) => StackValueKind::Int32,
            StackEntry::Int64Const(_) => StackValueKind::Int64,
            StackEntry::FloatConst { .. } => StackValueKind::Float,
            StackEntry::AddressOf { .. } => StackValueKind::ByRef,
            StackEntry::FunctionPointer { .. } => StackValueKind::NativeInt,
            StackEntry::Expression { kind, .. }
            | StackEntry::Load { kind, .. }
            | StackEntry::Spilled { kind, .. } => *kind,
        }
    }

    /// The managed type, when the entry carries one.
    #[must_use]
    pub fn ty(&self) -> Option<TypeId> {
        match self {
            StackEntry::Expression { ty, .. }
            | StackEntry::AddressOf { ty, .. }
            | StackEntry::Load { ty, .. }
            | StackEntry::Spilled { ty, .. } => *ty,
            _ => None,
        }
    }

    /// `true` if the rendered value reads `variable`.
    #[must_use]
    pub fn reads(&self, variable: &str) -> bool {
        match self {
            StackEntry::Load { variable: name, .. } => name == variable,
            _ => false,
        }
    }

    /// `true` if the entry is a compile-time constant.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            StackEntry::Int32Const(_) | StackEntry::Int64Const(_) | StackEntry::FloatConst { .. }
        )
    }

    /// The C++ expression of this entry converted to `target`.
    ///
    /// No cast is inserted when the entry already has the destination kind and the destination
    /// is not a narrower integer, or when the entry is a value type.
    #[must_use]
    pub fn coerced(&self, target_kind: StackValueKind, target_type: &str) -> String {
        if !is_cast_necessary(self.kind(), target_kind, target_type) {
            return self.to_string();
        }
        format!("(({target_type}){self})")
    }
}

/// `true` if a value of `source` must be cast before it is stored as `target_type`.
#[must_use]
pub fn is_cast_necessary(source: StackValueKind, target: StackValueKind, target_type: &str) -> bool {
    if source == StackValueKind::ValueType || target == StackValueKind::ValueType {
        return false;
    }
    if source != target {
        return true;
    }
    target_type != target.cpp_type()
}

impl fmt::Display for StackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackEntry::Int32Const(value) => {
                if *value == i32::MIN {
                    f.write_str("(int32_t)(0x80000000)")
                } else {
                    write!(f, "{value}")
                }
            }
            StackEntry::Int64Const(value) => {
                if *value == i64::MIN {
                    f.write_str("(int64_t)(INT64VAL(0x8000000000000000))")
                } else {
                    write!(f, "INT64VAL({value})")
                }
            }
            StackEntry::FloatConst { value, single } => {
                #[allow(clippy::cast_possible_truncation)]
                if *single {
                    let single_value = *value as f32;
                    write!(f, "__uint32_to_float(0x{:x})/* {single_value} */", single_value.to_bits())
                } else {
                    write!(f, "__uint64_to_double(0x{:x})/* {value} */", value.to_bits())
                }
            }
            StackEntry::Expression { text, .. } => f.write_str(text),
            StackEntry::AddressOf { lvalue, .. } => write!(f, "(void*)&{lvalue}"),
            StackEntry::FunctionPointer { text, .. } => f.write_str(text),
            StackEntry::Load { variable, .. } => f.write_str(variable),
            StackEntry::Spilled { name, .. } => f.write_str(name),
        }
    }
}

/// Kind and value-type identity of one stack slot, the unit block entry stacks are compared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackShape {
    /// Stack kind
    pub kind: StackValueKind,
    /// Value-type identity; `None` for every other kind
    pub value_type: Option<TypeId>,
}

impl StackShape {
    /// Shape of an entry.
    #[must_use]
    pub fn of(entry: &StackEntry) -> Self {
        let kind = entry.kind();
        StackShape {
            kind,
            value_type: if kind == StackValueKind::ValueType { entry.ty() } else { None },
        }
    }

    /// C++ type of a slot with this shape.
    #[must_use]
    pub fn cpp_type(&self, ctx: &TypeSystemContext) -> String {
        match (self.kind, self.value_type) {
            (StackValueKind::ValueType, Some(ty)) => ctypes::value_type_name(ctx, ty),
            (kind, _) => kind.cpp_type().to_string(),
        }
    }
}

/// The evaluation stack of the block being imported.
#[derive(Debug, Default, Clone)]
pub struct EvaluationStack {
    entries: Vec<StackEntry>,
}

impl EvaluationStack {
    /// An empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a value.
    pub fn push(&mut self, entry: StackEntry) {
        self.entries.push(entry);
    }

    /// Pop the top value.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on underflow.
    pub fn pop(&mut self) -> Result<StackEntry> {
        self.entries
            .pop()
            .ok_or_else(|| malformed_error!("Evaluation stack underflow"))
    }

    /// Pop `count` values, returned bottom first.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on underflow.
    pub fn pop_many(&mut self, count: usize) -> Result<Vec<StackEntry>> {
        if count > self.entries.len() {
            return Err(malformed_error!(
                "Evaluation stack underflow: need {}, have {}",
                count,
                self.entries.len()
            ));
        }
        Ok(self.entries.split_off(self.entries.len() - count))
    }

    /// The value `depth` entries below the top.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on underflow.
    pub fn peek(&self, depth: usize) -> Result<&StackEntry> {
        self.entries
            .len()
            .checked_sub(depth + 1)
            .and_then(|index| self.entries.get(index))
            .ok_or_else(|| malformed_error!("Evaluation stack underflow"))
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the stack holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every value.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Values, bottom first.
    pub fn iter(&self) -> impl Iterator<Item = &StackEntry> {
        self.entries.iter()
    }

    /// Mutable values, bottom first.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StackEntry> {
        self.entries.iter_mut()
    }

    /// Shapes of the current values, bottom first.
    #[must_use]
    pub fn shape(&self) -> Vec<StackShape> {
        self.entries.iter().map(StackShape::of).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_ordered() {
        assert!(StackValueKind::Int32 < StackValueKind::Int64);
        assert!(StackValueKind::NativeInt < StackValueKind::ByRef);
        assert!(StackValueKind::ObjRef < StackValueKind::Float);
        assert_eq!(
            StackValueKind::Int32.widen(StackValueKind::NativeInt),
            StackValueKind::NativeInt
        );
        assert_eq!(StackValueKind::Float.widen(StackValueKind::Int64), StackValueKind::Float);
    }

    #[test]
    fn constants_render_exactly() {
        assert_eq!(StackEntry::Int32Const(-7).to_string(), "-7");
        assert_eq!(StackEntry::Int32Const(i32::MIN).to_string(), "(int32_t)(0x80000000)");
        assert_eq!(StackEntry::Int64Const(5).to_string(), "INT64VAL(5)");
        assert_eq!(
            StackEntry::Int64Const(i64::MIN).to_string(),
            "(int64_t)(INT64VAL(0x8000000000000000))"
        );
        assert_eq!(
            StackEntry::FloatConst { value: 1.0, single: false }.to_string(),
            "__uint64_to_double(0x3ff0000000000000)/* 1 */"
        );
        assert_eq!(
            StackEntry::FloatConst { value: 1.0, single: true }.to_string(),
            "__uint32_to_float(0x3f800000)/* 1 */"
        );
    }

    #[test]
    fn casts_only_where_needed() {
        let value = StackEntry::expression(StackValueKind::Int32, "_1");
        assert_eq!(value.coerced(StackValueKind::Int32, "int32_t"), "_1");
        assert_eq!(value.coerced(StackValueKind::Int32, "uint8_t"), "((uint8_t)_1)");
        assert_eq!(value.coerced(StackValueKind::Int64, "int64_t"), "((int64_t)_1)");
    }

    #[test]
    fn pop_many_keeps_order() {
        let mut stack = EvaluationStack::new();
        stack.push(StackEntry::Int32Const(1));
        stack.push(StackEntry::Int32Const(2));
        stack.push(StackEntry::Int32Const(3));
        let popped = stack.pop_many(2).unwrap();
        assert_eq!(popped, vec![StackEntry::Int32Const(2), StackEntry::Int32Const(3)]);
        assert_eq!(stack.len(), 1);
        assert!(stack.pop_many(2).is_err());
        assert_eq!(stack.peek(0).unwrap(), &StackEntry::Int32Const(1));
    }
}

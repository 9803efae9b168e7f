//! Nodes of the reachable set handed to the compiler.
//!
//! Reachability is computed by whoever drives the compiler; the session only consumes the
//! result. Every node carries a `compiled` flag so that a driver can feed the same set through
//! several compilations and only pay for what is new.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    object::ObjectNode,
    typesystem::{MethodId, TypeId, TypeSystemContext},
    Result,
};

/// What a node stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// A method to lower, declare or bind to its native import
    Method(MethodId),
    /// A type whose body, statics and method table are emitted
    Type(TypeId),
    /// A data blob with relocations
    Data(ObjectNode),
}

/// One element of the reachable set.
#[derive(Debug)]
pub struct Node {
    kind: NodeKind,
    compiled: AtomicBool,
}

impl Node {
    /// A method node.
    #[must_use]
    pub fn method(method: MethodId) -> Self {
        Self::new(NodeKind::Method(method))
    }

    /// A type node.
    #[must_use]
    pub fn ty(ty: TypeId) -> Self {
        Self::new(NodeKind::Type(ty))
    }

    /// A data node.
    #[must_use]
    pub fn data(node: ObjectNode) -> Self {
        Self::new(NodeKind::Data(node))
    }

    fn new(kind: NodeKind) -> Self {
        Node {
            kind,
            compiled: AtomicBool::new(false),
        }
    }

    /// What the node stands for.
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The symbol the node's output is emitted under. Stable across sessions over the same
    /// metadata.
    ///
    /// # Errors
    /// Propagates mangling failures of methods.
    pub fn mangled_name(&self, ctx: &TypeSystemContext) -> Result<String> {
        Ok(match &self.kind {
            NodeKind::Method(method) => ctx.mangled_method_name(*method)?.to_string(),
            NodeKind::Type(ty) => ctx.mangled_type_name(*ty).to_string(),
            NodeKind::Data(node) => node.name.clone(),
        })
    }

    /// `true` once a compilation has emitted the node.
    #[must_use]
    pub fn is_compiled(&self) -> bool {
        self.compiled.load(Ordering::Acquire)
    }

    /// Record that the node has been emitted.
    pub fn mark_compiled(&self) {
        self.compiled.store(true, Ordering::Release);
    }
}

//! # Signature
//!
//! This module describes targets and derives the exact signature a matching
//! replacement callable must have

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

/// Type tag for a parameter or return value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    /// No value; only meaningful as a return type
    Unit,
    /// Boolean
    Bool,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// Untyped pointer
    Ptr,
    /// Reference to a named heap type
    Object(Arc<str>),
    /// Named value aggregate, passed by value
    Struct(Arc<str>),
    /// Reference to a value of the inner type
    ByRef(Box<TypeDesc>),
}

impl TypeDesc {
    /// Whether values of this type fit in one pointer-sized word at a native
    /// call boundary. Floats qualify because the bridge carries them as raw
    /// bit patterns; by-value aggregates do not.
    pub fn is_word(&self) -> bool {
        !matches!(self, TypeDesc::Struct(_))
    }
}

impl Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDesc::Unit => write!(f, "unit"),
            TypeDesc::Bool => write!(f, "bool"),
            TypeDesc::I32 => write!(f, "i32"),
            TypeDesc::I64 => write!(f, "i64"),
            TypeDesc::F32 => write!(f, "f32"),
            TypeDesc::F64 => write!(f, "f64"),
            TypeDesc::Ptr => write!(f, "ptr"),
            TypeDesc::Object(name) => write!(f, "{name}"),
            TypeDesc::Struct(name) => write!(f, "struct {name}"),
            TypeDesc::ByRef(inner) => write!(f, "&{inner}"),
        }
    }
}

/// Whether a target is called with an implicit self argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Free function, no implicit arguments
    Static,
    /// Method on an instance; native calls receive the instance first
    Instance,
}

/// Identifies one callable unit to be redirected.
///
/// Captured once by the caller and treated as read-only input everywhere in
/// this crate.
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    /// Type the target is declared on
    declaring: TypeDesc,
    /// Name of the target within its declaring type
    name: Arc<str>,
    /// Static or instance calling shape
    kind: TargetKind,
    /// Declared parameter types, in order, excluding any implicit self
    params: Vec<TypeDesc>,
    /// Declared return type
    ret: TypeDesc,
    /// Instruction body, if the target has an inspectable one
    body: Option<Arc<[u8]>>,
    /// Address of the target's native entry point
    entry: usize,
}

impl TargetDescriptor {
    /// Captures a target descriptor.
    ///
    /// # Safety
    ///
    /// `entry` must be the address of the target's native entry point and
    /// must stay valid for as long as the descriptor (or any patcher built
    /// from it) is used.
    pub unsafe fn new(
        declaring: TypeDesc,
        name: impl Into<Arc<str>>,
        kind: TargetKind,
        params: Vec<TypeDesc>,
        ret: TypeDesc,
        body: Option<Arc<[u8]>>,
        entry: *const u8,
    ) -> Self {
        Self {
            declaring,
            name: name.into(),
            kind,
            params,
            ret,
            body,
            entry: entry as usize,
        }
    }

    /// Type the target is declared on
    pub fn declaring(&self) -> &TypeDesc {
        &self.declaring
    }

    /// Name of the target
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static or instance calling shape
    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Declared parameter types, excluding any implicit self
    pub fn params(&self) -> &[TypeDesc] {
        &self.params
    }

    /// Declared return type
    pub fn ret(&self) -> &TypeDesc {
        &self.ret
    }

    /// Whether the target has an inspectable instruction body
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Address of the target's native entry point
    pub fn entry(&self) -> *const u8 {
        self.entry as *const u8
    }
}

impl Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.declaring, self.name)
    }
}

/// Derived calling shape: ordered parameter types (with the implicit self
/// prepended for instance targets) plus a return type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Parameter types the native calling convention expects, in order
    params: Vec<TypeDesc>,
    /// Return type, [`TypeDesc::Unit`] for void-like targets
    ret: TypeDesc,
}

impl Signature {
    /// Creates a signature directly from its parts
    pub fn new(params: Vec<TypeDesc>, ret: TypeDesc) -> Self {
        Self { params, ret }
    }

    /// Derives the signature a replacement for `target` must have.
    ///
    /// Static targets keep their declared parameters as-is. Instance targets
    /// get one synthetic leading parameter: the declaring type itself, or a
    /// reference to it when the declaring type is a value aggregate.
    ///
    /// This is a pure, total derivation; there is no failure path.
    pub fn of_target(target: &TargetDescriptor) -> Self {
        let mut params = Vec::with_capacity(target.params().len() + 1);
        if target.kind() == TargetKind::Instance {
            params.push(match target.declaring() {
                agg @ TypeDesc::Struct(_) => TypeDesc::ByRef(Box::new(agg.clone())),
                other => other.clone(),
            });
        }
        params.extend_from_slice(target.params());
        Self {
            params,
            ret: target.ret().clone(),
        }
    }

    /// Parameter types, in calling-convention order
    pub fn params(&self) -> &[TypeDesc] {
        &self.params
    }

    /// Return type
    pub fn ret(&self) -> &TypeDesc {
        &self.ret
    }

    /// Number of parameters a matching native entry receives
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Descriptor of a callable shape, one per distinct [`Signature`].
///
/// Interchangeable by construction: [`CallableType::of`] interns descriptors,
/// so equal signatures always yield the same `Arc`.
#[derive(Debug)]
pub struct CallableType {
    /// The signature this callable shape matches
    sig: Signature,
}

lazy_static! {
    /// Cache of synthesized callable types, keyed by signature
    static ref TYPES: Mutex<HashMap<Signature, Arc<CallableType>>> = Mutex::new(HashMap::new());
}

impl CallableType {
    /// Returns the callable type matching `sig`, synthesizing it on first use
    pub fn of(sig: Signature) -> Arc<Self> {
        let mut types = TYPES.lock().unwrap();
        types
            .entry(sig.clone())
            .or_insert_with(|| Arc::new(Self { sig }))
            .clone()
    }

    /// The signature this callable shape matches
    pub fn signature(&self) -> &Signature {
        &self.sig
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;
    use std::sync::Arc;

    use super::{CallableType, Signature, TargetDescriptor, TargetKind, TypeDesc};

    /// Builds a descriptor for tests; the entry address is never dereferenced here
    fn descriptor(kind: TargetKind, declaring: TypeDesc) -> TargetDescriptor {
        unsafe {
            TargetDescriptor::new(
                declaring,
                "get",
                kind,
                vec![TypeDesc::I32, TypeDesc::Ptr],
                TypeDesc::I64,
                None,
                ptr::null(),
            )
        }
    }

    #[test]
    /// Static targets keep their declared parameters verbatim
    fn test_static_signature() {
        let target = descriptor(TargetKind::Static, TypeDesc::Object(Arc::from("T")));
        let sig = Signature::of_target(&target);

        assert_eq!(sig.params(), &[TypeDesc::I32, TypeDesc::Ptr]);
        assert_eq!(sig.ret(), &TypeDesc::I64);
        assert_eq!(sig.arity(), 2);
    }

    #[test]
    /// Instance targets get one leading parameter of the declaring type
    fn test_instance_signature() {
        let declaring = TypeDesc::Object(Arc::from("T"));
        let target = descriptor(TargetKind::Instance, declaring.clone());
        let sig = Signature::of_target(&target);

        assert_eq!(sig.arity(), 3);
        assert_eq!(sig.params()[0], declaring);
        assert_eq!(&sig.params()[1..], &[TypeDesc::I32, TypeDesc::Ptr]);
    }

    #[test]
    /// Value-aggregate declaring types are prepended as a reference surrogate
    fn test_instance_signature_on_aggregate() {
        let declaring = TypeDesc::Struct(Arc::from("V"));
        let target = descriptor(TargetKind::Instance, declaring.clone());
        let sig = Signature::of_target(&target);

        assert_eq!(sig.params()[0], TypeDesc::ByRef(Box::new(declaring)));
    }

    #[test]
    /// Equal signatures synthesize the identical callable type
    fn test_callable_type_interned() {
        let sig = Signature::new(vec![TypeDesc::I32], TypeDesc::Unit);
        let a = CallableType::of(sig.clone());
        let b = CallableType::of(sig);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.signature().arity(), 1);
    }

    #[test]
    /// Distinct signatures get distinct callable types
    fn test_callable_type_distinct() {
        let a = CallableType::of(Signature::new(vec![TypeDesc::I32], TypeDesc::Unit));
        let b = CallableType::of(Signature::new(vec![TypeDesc::I64], TypeDesc::Unit));

        assert!(!Arc::ptr_eq(&a, &b));
    }
}

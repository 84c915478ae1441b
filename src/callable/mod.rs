//! # Callable
//!
//! This module covers the boxed representation of arguments and results, and
//! the type-erased callables that redirections dispatch to

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::sig::{CallableType, Signature, TypeDesc};
use crate::store::StoreError;

/// Errors raised while invoking a callable
#[derive(Debug, Error)]
pub enum CallError {
    /// The callable forwards through a reference slot that was never written
    #[error("{0}")]
    Store(#[from] StoreError),
    /// The argument list does not match the callable's signature
    #[error("callable expects {expected} arguments, got {got}")]
    BadArguments {
        /// Arity of the callable's signature
        expected: usize,
        /// Number of arguments supplied
        got: usize,
    },
}

/// One argument or return value, boxed to match a [`TypeDesc`].
///
/// Values cross the native boundary as pointer-sized words: integers
/// sign-extended, floats as their raw bit patterns, references as addresses.
/// By-value aggregates have no word form and never cross that boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// No value
    Unit,
    /// Boolean
    Bool(bool),
    /// 32-bit signed integer
    I32(i32),
    /// 64-bit signed integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// Reference, carried as an opaque address
    Ptr(*mut ()),
}

impl Value {
    /// Encodes this value as one native word
    pub fn to_word(self) -> usize {
        match self {
            Value::Unit => 0,
            Value::Bool(v) => v as usize,
            Value::I32(v) => v as i64 as usize,
            Value::I64(v) => v as usize,
            Value::F32(v) => v.to_bits() as usize,
            Value::F64(v) => v.to_bits() as usize,
            Value::Ptr(v) => v as usize,
        }
    }

    /// Decodes one native word as a value of type `ty`
    pub fn from_word(word: usize, ty: &TypeDesc) -> Self {
        match ty {
            TypeDesc::Unit => Value::Unit,
            TypeDesc::Bool => Value::Bool(word != 0),
            TypeDesc::I32 => Value::I32(word as u32 as i32),
            TypeDesc::I64 => Value::I64(word as i64),
            TypeDesc::F32 => Value::F32(f32::from_bits(word as u32)),
            TypeDesc::F64 => Value::F64(f64::from_bits(word as u64)),
            // References of every flavor are plain addresses at this level
            _ => Value::Ptr(word as *mut ()),
        }
    }
}

/// A type-erased callable tagged with the [`CallableType`] it matches.
///
/// This is the uniform currency of the crate: replacements arrive as
/// callables, alternate entries are wrapped into callables, and proxies are
/// callables that forward through a reference slot.
pub struct Callable {
    /// Shape of this callable
    ty: Arc<CallableType>,
    /// The invocation itself
    invoke: Box<dyn Fn(&[Value]) -> Result<Value, CallError> + Send + Sync>,
}

impl Callable {
    /// Creates a callable of shape `ty` from an invocation closure.
    ///
    /// The closure is only ever handed argument lists matching `ty`; that
    /// invariant is enforced by [`Callable::invoke`], so closures may index
    /// arguments without re-checking.
    pub fn new(
        ty: Arc<CallableType>,
        invoke: impl Fn(&[Value]) -> Result<Value, CallError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            ty,
            invoke: Box::new(invoke),
        }
    }

    /// Shape of this callable
    pub fn ty(&self) -> &Arc<CallableType> {
        &self.ty
    }

    /// Signature of this callable
    pub fn signature(&self) -> &Signature {
        self.ty.signature()
    }

    /// Invokes the callable with `args`, which must match the signature's
    /// arity
    pub fn invoke(&self, args: &[Value]) -> Result<Value, CallError> {
        let expected = self.signature().arity();
        if args.len() != expected {
            return Err(CallError::BadArguments {
                expected,
                got: args.len(),
            });
        }
        (self.invoke)(args)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable({})", self.signature())
    }
}

//! # Wrapper
//!
//! This module bridges between callables and raw native entries in both
//! directions: [`bind`] leases a pre-generated thunk whose entry address can
//! be branched to from native code, and [`entry_callable`] wraps a raw entry
//! back into a [`Callable`].
//!
//! The bridge convention is one pointer-sized word per parameter (floats as
//! raw bit patterns, references as addresses), for a bounded set of arities.
//! Signatures outside that set are rejected at bind time rather than
//! miscompiled.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use thiserror::Error;

use crate::callable::{Callable, Value};
use crate::sig::{CallableType, TypeDesc};

/// Highest parameter count the native bridge supports
pub const MAX_BRIDGE_ARITY: usize = 6;

/// Number of concurrently bindable thunks per arity
const SLOT_COUNT: usize = 16;

/// Errors when binding a callable to a native entry
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The signature has more parameters than the bridge's thunks
    #[error("signature has {0} parameters, more than the native bridge supports")]
    TooManyArguments(usize),
    /// A type in the signature has no single-word native form
    #[error("type {0} cannot cross the native boundary by value")]
    NotBridgeable(TypeDesc),
    /// Every bridge slot is bound already
    #[error("all bridge slots are in use")]
    Exhausted,
}

/// Published callable for each bridge slot; null while the slot is free
static CONTEXTS: [AtomicPtr<Callable>; SLOT_COUNT] =
    [const { AtomicPtr::new(ptr::null_mut()) }; SLOT_COUNT];

lazy_static! {
    /// Slots not currently leased to a binding
    static ref FREE_SLOTS: Mutex<Vec<usize>> = Mutex::new((0..SLOT_COUNT).rev().collect());
}

/// Shared tail of every thunk: decode the words, invoke the slot's callable,
/// encode the result
fn dispatch(slot: usize, words: &[usize]) -> usize {
    let raw = CONTEXTS[slot].load(Ordering::Acquire);
    // a thunk is only reachable while its binding is alive, and the binding
    // keeps the callable anchored
    let callable = unsafe { raw.as_ref() }.expect("bridge thunk called without a bound callable");

    let args: Vec<Value> = callable
        .signature()
        .params()
        .iter()
        .zip(words.iter())
        .map(|(ty, word)| Value::from_word(*word, ty))
        .collect();

    match callable.invoke(&args) {
        Ok(value) => value.to_word(),
        // unwinding cannot cross the native frame below us; this aborts
        Err(error) => panic!("native bridge call failed: {error}"),
    }
}

/// Builds the per-slot entry table for one thunk
macro_rules! slot_table {
    ($thunk:ident) => {
        [
            $thunk::<0>,
            $thunk::<1>,
            $thunk::<2>,
            $thunk::<3>,
            $thunk::<4>,
            $thunk::<5>,
            $thunk::<6>,
            $thunk::<7>,
            $thunk::<8>,
            $thunk::<9>,
            $thunk::<10>,
            $thunk::<11>,
            $thunk::<12>,
            $thunk::<13>,
            $thunk::<14>,
            $thunk::<15>,
        ]
    };
}

/// Defines the forwarding thunk and entry table for each supported arity
macro_rules! thunks {
    ($($thunk:ident, $table:ident: $($arg:ident),*;)+) => {$(
        /// Forwarding thunk; `S` selects the context slot
        extern "C" fn $thunk<const S: usize>($($arg: usize),*) -> usize {
            dispatch(S, &[$($arg),*])
        }
        /// Entry table, one thunk per slot
        static $table: [extern "C" fn($($arg: usize),*) -> usize; SLOT_COUNT] =
            slot_table!($thunk);
    )+};
}

thunks! {
    thunk0, THUNKS_0: ;
    thunk1, THUNKS_1: a0;
    thunk2, THUNKS_2: a0, a1;
    thunk3, THUNKS_3: a0, a1, a2;
    thunk4, THUNKS_4: a0, a1, a2, a3;
    thunk5, THUNKS_5: a0, a1, a2, a3, a4;
    thunk6, THUNKS_6: a0, a1, a2, a3, a4, a5;
}

/// Entry address of the thunk for `arity` in `slot`
fn entry_for(arity: usize, slot: usize) -> usize {
    match arity {
        0 => THUNKS_0[slot] as usize,
        1 => THUNKS_1[slot] as usize,
        2 => THUNKS_2[slot] as usize,
        3 => THUNKS_3[slot] as usize,
        4 => THUNKS_4[slot] as usize,
        5 => THUNKS_5[slot] as usize,
        6 => THUNKS_6[slot] as usize,
        // bind checks the arity before leasing a slot
        _ => unreachable!(),
    }
}

/// A leased native entry bound to one callable.
///
/// While the binding is alive, calls into [`NativeBinding::entry`] dispatch
/// to the callable. Dropping the binding returns the thunk to the pool; the
/// owner must keep the binding alive while native calls may still be
/// dispatching through it.
pub struct NativeBinding {
    /// Leased context slot
    slot: usize,
    /// Thunk entry address for the callable's arity
    entry: usize,
    /// Keeps the published callable alive for the binding's lifetime
    _anchor: Arc<Callable>,
}

impl NativeBinding {
    /// Raw entry address native code can branch to
    pub fn entry(&self) -> *const u8 {
        self.entry as *const u8
    }
}

impl Drop for NativeBinding {
    fn drop(&mut self) {
        CONTEXTS[self.slot].store(ptr::null_mut(), Ordering::Release);
        FREE_SLOTS.lock().unwrap().push(self.slot);
    }
}

/// Binds `callable` to a native entry matching its signature.
///
/// The callable is published before the entry is handed out, so the entry is
/// dispatchable as soon as this returns.
pub fn bind(callable: Arc<Callable>) -> Result<NativeBinding, BridgeError> {
    let sig = callable.signature();
    if sig.arity() > MAX_BRIDGE_ARITY {
        return Err(BridgeError::TooManyArguments(sig.arity()));
    }
    if let Some(ty) = sig.params().iter().find(|ty| !ty.is_word()) {
        return Err(BridgeError::NotBridgeable(ty.clone()));
    }
    if !sig.ret().is_word() {
        return Err(BridgeError::NotBridgeable(sig.ret().clone()));
    }

    let slot = FREE_SLOTS
        .lock()
        .unwrap()
        .pop()
        .ok_or(BridgeError::Exhausted)?;
    let entry = entry_for(sig.arity(), slot);
    CONTEXTS[slot].store(Arc::as_ptr(&callable) as *mut Callable, Ordering::Release);

    Ok(NativeBinding {
        slot,
        entry,
        _anchor: callable,
    })
}

/// Calls a raw entry with the bridge convention
unsafe fn call_words(entry: usize, words: &[usize]) -> usize {
    type W = usize;
    match *words {
        [] => mem::transmute::<usize, extern "C" fn() -> W>(entry)(),
        [a] => mem::transmute::<usize, extern "C" fn(W) -> W>(entry)(a),
        [a, b] => mem::transmute::<usize, extern "C" fn(W, W) -> W>(entry)(a, b),
        [a, b, c] => mem::transmute::<usize, extern "C" fn(W, W, W) -> W>(entry)(a, b, c),
        [a, b, c, d] => mem::transmute::<usize, extern "C" fn(W, W, W, W) -> W>(entry)(a, b, c, d),
        [a, b, c, d, e] => {
            mem::transmute::<usize, extern "C" fn(W, W, W, W, W) -> W>(entry)(a, b, c, d, e)
        }
        [a, b, c, d, e, f] => {
            mem::transmute::<usize, extern "C" fn(W, W, W, W, W, W) -> W>(entry)(a, b, c, d, e, f)
        }
        // callable construction already bounded the arity
        _ => unreachable!(),
    }
}

/// Wraps a raw native entry as a callable of shape `ty`.
///
/// # Safety
///
/// `entry` must be executable code taking `ty`'s parameters and returning its
/// result with the bridge convention, and must stay valid for as long as the
/// returned callable may be invoked. `ty`'s arity must not exceed
/// [`MAX_BRIDGE_ARITY`].
pub unsafe fn entry_callable(entry: *const u8, ty: Arc<CallableType>) -> Callable {
    let entry = entry as usize;
    let ret = ty.signature().ret().clone();
    Callable::new(ty, move |args| {
        let words: Vec<usize> = args.iter().map(|value| value.to_word()).collect();
        // Safety: the creator vouched for the entry matching this shape
        let word = unsafe { call_words(entry, &words) };
        Ok(Value::from_word(word, &ret))
    })
}

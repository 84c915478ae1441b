//! This module contains the patcher for targets with no inspectable
//! instruction body, which can only be redirected at their native entry

use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::callable::Callable;
use crate::hook::jmp::JmpHook;
use crate::hook::{Hook, HookHandle};
use crate::sig::{CallableType, Signature, TargetDescriptor};
use crate::store::ReferenceSlot;
use crate::wrapper::{self, BridgeError, NativeBinding};

use super::MethodPatcher;

/// Errors when patching a bodyless target
#[derive(Debug, Error)]
pub enum PatchError<E> {
    /// The replacement does not have the target's derived signature.
    /// Caught before any state changes; a mismatched replacement would
    /// corrupt the first call dispatched to it.
    #[error("replacement signature {got} does not match target signature {expected}")]
    SignatureMismatch {
        /// Signature derived from the target
        expected: Signature,
        /// Signature of the supplied replacement
        got: Signature,
    },
    /// The replacement could not be bound to a native entry
    #[error("{0}")]
    Bridge(#[from] BridgeError),
    /// The target's entry cannot host a redirection
    #[error("{0}")]
    Unsupported(E),
}

/// Patches targets that have no body by rewriting their native entry.
///
/// One instance owns all per-target redirection state: the derived callable
/// type, the reference slot its proxy forwards through, the generated proxy,
/// and the installed hook handle. The first `detour_to` installs the hook and
/// publishes the alternate entry into the slot; every later `detour_to` only
/// retargets, so the proxy keeps reaching the body that was in effect before
/// the first redirection.
pub struct NativeDetourPatcher<H: Hook = JmpHook> {
    /// The target being patched
    target: TargetDescriptor,
    /// Callable type matching the target's derived signature
    ty: Arc<CallableType>,
    /// Slot the proxy forwards through; holds the alternate-entry callable
    /// once a redirection is installed
    slot: Arc<ReferenceSlot>,
    /// Proxy standing in for the original; built once
    proxy: Option<Arc<Callable>>,
    /// Hook implementation used to rewrite the entry
    hook: H,
    /// Handle of the installed redirection, if any
    installed: Option<H::Handle>,
    /// Every binding ever handed to the hook. Superseded bindings are kept
    /// because in-flight native calls may still be dispatching through them.
    bindings: Vec<NativeBinding>,
}

impl NativeDetourPatcher<JmpHook> {
    /// Creates a patcher for `target` using the platform jmp hook
    pub fn new(target: TargetDescriptor) -> Self {
        Self::with_hook(target, JmpHook::new())
    }

    /// Resolution predicate: bodyless targets can only be patched at their
    /// native entry, so this patcher applies exactly when the target has no
    /// inspectable body.
    ///
    /// Registered with the patch-resolution registry, which must consult it
    /// before any body-rewriting patcher kind.
    pub fn try_resolve(target: &TargetDescriptor) -> Option<Self> {
        if target.has_body() {
            return None;
        }
        Some(Self::new(target.clone()))
    }
}

impl<H: Hook> NativeDetourPatcher<H> {
    /// Creates a patcher for `target` using a caller-supplied hook
    pub fn with_hook(target: TargetDescriptor, hook: H) -> Self {
        let sig = Signature::of_target(&target);
        debug!("preparing native detour for {target}: {sig}");
        Self {
            ty: CallableType::of(sig),
            slot: ReferenceSlot::allocate(None),
            proxy: None,
            hook,
            installed: None,
            bindings: Vec::new(),
            target,
        }
    }

    /// The target being patched
    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// Signature a replacement must have
    pub fn signature(&self) -> &Signature {
        self.ty.signature()
    }
}

impl<H: Hook> MethodPatcher for NativeDetourPatcher<H> {
    type Error = PatchError<H::Error>;

    /// Builds the proxy for the target's original behavior.
    ///
    /// The proxy forwards every call to whatever callable currently sits in
    /// the reference slot; until the first `detour_to` publishes the
    /// alternate entry there, invoking it fails with an empty-slot error.
    fn prepare_original(&mut self) -> Arc<Callable> {
        if let Some(proxy) = &self.proxy {
            return proxy.clone();
        }
        let slot = self.slot.clone();
        let proxy = Arc::new(Callable::new(self.ty.clone(), move |args| {
            slot.read()?.invoke(args)
        }));
        self.proxy = Some(proxy.clone());
        proxy
    }

    fn detour_to(&mut self, replacement: Arc<Callable>) -> Result<Arc<Callable>, Self::Error> {
        if replacement.signature() != self.ty.signature() {
            return Err(PatchError::SignatureMismatch {
                expected: self.ty.signature().clone(),
                got: replacement.signature().clone(),
            });
        }

        let binding = wrapper::bind(replacement.clone())?;
        match &self.installed {
            // Retargeting moves only the entry's destination. The slot is
            // left alone: the alternate entry never changes, so the proxy
            // keeps reaching the pre-redirection body.
            Some(handle) => unsafe {
                handle
                    .retarget(binding.entry())
                    .map_err(PatchError::Unsupported)?;
            },
            None => {
                // Safety: the descriptor's creator vouched for the entry
                // address, and the bound thunk matches the derived signature
                let handle = unsafe { self.hook.install(self.target.entry(), binding.entry()) }
                    .map_err(PatchError::Unsupported)?;
                let alt = unsafe { wrapper::entry_callable(handle.alt_entry(), self.ty.clone()) };
                self.slot.write(Arc::new(alt));
                self.installed = Some(handle);
            }
        }
        self.bindings.push(binding);

        debug!("{} now detours to {:?}", self.target, replacement);
        Ok(replacement)
    }

    /// Bodyless targets have no instruction body to copy
    fn copy_original(&mut self) -> Option<Arc<Callable>> {
        None
    }
}

//! Function registry — the statically-typed stand-in for the source
//! material's `getattr(__import__(mod_name), func_name)` dynamic lookup.
//!
//! See spec §4.9 and Design Notes "Dynamic dispatch by module/function
//! name": a compiled, statically typed runtime has no reflection step to
//! fall back on, so embedders register callables ahead of time under the
//! `(module_name, func_name)` pair a [`crate::context::FnRef`] names.
//! [`crate::remote_main`] consults this registry to dispatch incoming
//! `CALL_FUNCTION` bodies.

use std::collections::HashMap;

use crate::context::FnRef;
use crate::marshal::RemoteValue;

/// Failure looking up or invoking a registered function.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no function registered for {0:?}.{1:?}")]
    NotFound(String, String),

    #[error("{0}")]
    Failed(String),
}

type Func = Box<dyn Fn(Vec<RemoteValue>, RemoteValue) -> Result<RemoteValue, String> + Send + Sync>;

/// A name → callable table populated by embedders before starting a
/// remote context (spec §4.9).
#[derive(Default)]
pub struct FunctionRegistry {
    funcs: HashMap<FnRef, Func>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `module_name`/`func_name`. `f` receives the
    /// positional args and the kwargs body as sent by `CallWithDeadline`
    /// and returns a marshalled result or an error message, which the
    /// caller reports back as a [`crate::error::RemoteException`].
    pub fn register(
        &mut self,
        module_name: impl Into<String>,
        func_name: impl Into<String>,
        f: impl Fn(Vec<RemoteValue>, RemoteValue) -> Result<RemoteValue, String> + Send + Sync + 'static,
    ) {
        self.funcs
            .insert(FnRef::new(module_name, func_name), Box::new(f));
    }

    /// Look up and invoke the function named by `fn_ref`.
    pub fn dispatch(
        &self,
        fn_ref: &FnRef,
        args: Vec<RemoteValue>,
        kwargs: RemoteValue,
    ) -> Result<RemoteValue, DispatchError> {
        let f = self.funcs.get(fn_ref).ok_or_else(|| {
            DispatchError::NotFound(fn_ref.module_name.clone(), fn_ref.func_name.clone())
        })?;
        f(args, kwargs).map_err(DispatchError::Failed)
    }
}

//! Type-parameter specialization for trampolines
//!
//! A call site that creates trampolines may carry a template of type
//! parameters. Each one is instantiated against the site's type environment
//! and the values bound to it at run time; the results are captured in the
//! trampoline's [`BoundState`].

use crate::ffi::error::{FfiError, FfiResult};
use crate::value::{Value, ValueId};
use std::fmt;
use std::sync::Arc;

/// One entry of a call site's parameter template
#[derive(Debug, Clone)]
pub enum TypeParam {
    /// A type variable of the environment
    Var(Arc<str>),
    /// A value fixed at compile time
    Const(Value),
}

/// Identity of a template entry, used to tell call sites apart
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeParamId {
    Var(Arc<str>),
    Const(ValueId),
}

impl TypeParam {
    pub fn var(name: &str) -> Self {
        TypeParam::Var(Arc::from(name))
    }

    pub fn id(&self) -> TypeParamId {
        match self {
            TypeParam::Var(name) => TypeParamId::Var(Arc::clone(name)),
            TypeParam::Const(value) => TypeParamId::Const(value.id()),
        }
    }
}

impl fmt::Display for TypeParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeParam::Var(name) => write!(f, "{}", name),
            TypeParam::Const(value) => write!(f, "{:?}", value),
        }
    }
}

/// Type variables in scope at a call site, in binding order
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    vars: Vec<Arc<str>>,
}

impl TypeEnv {
    pub fn new(vars: &[&str]) -> Self {
        Self {
            vars: vars.iter().map(|v| Arc::from(*v)).collect(),
        }
    }

    pub const fn empty() -> Self {
        Self { vars: Vec::new() }
    }

    pub fn position(&self, var: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.as_ref() == var)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// The type system's "instantiate in environment" operation
pub trait Specializer: Send + Sync {
    fn instantiate(&self, param: &TypeParam, env: &TypeEnv, values: &[Value]) -> FfiResult<Value>;
}

/// Direct substitution of environment variables
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSpecializer;

impl Specializer for EnvSpecializer {
    fn instantiate(&self, param: &TypeParam, env: &TypeEnv, values: &[Value]) -> FfiResult<Value> {
        match param {
            TypeParam::Const(value) => Ok(value.clone()),
            TypeParam::Var(name) => {
                let index = env.position(name).ok_or_else(|| FfiError::Specialization {
                    parameter: name.to_string(),
                    reason: "variable is not bound in the environment".to_string(),
                })?;
                values
                    .get(index)
                    .cloned()
                    .ok_or_else(|| FfiError::Specialization {
                        parameter: name.to_string(),
                        reason: format!(
                            "environment has {} variables but only {} values",
                            env.len(),
                            values.len()
                        ),
                    })
            }
        }
    }
}

/// State a trampoline closes over
///
/// Boxed by its owner so generated code can embed its address.
#[derive(Debug)]
pub struct BoundState {
    bound: Value,
    parameters: Vec<Option<Value>>,
}

impl BoundState {
    pub fn new(bound: Value, parameters: Vec<Option<Value>>) -> Self {
        Self { bound, parameters }
    }

    pub fn bound(&self) -> &Value {
        &self.bound
    }

    /// Specialized parameters; `None` where the value was not worth retaining
    pub fn parameters(&self) -> &[Option<Value>] {
        &self.parameters
    }
}

/// Instantiate every template entry, keeping only values that are safe to
/// compare by identity (concrete immutable types and the top type)
pub fn specialize_parameters(
    specializer: &dyn Specializer,
    template: &[TypeParam],
    env: &TypeEnv,
    values: &[Value],
) -> FfiResult<Vec<Option<Value>>> {
    template
        .iter()
        .map(|param| {
            let value = specializer.instantiate(param, env, values)?;
            Ok(value.is_retainable_parameter().then_some(value))
        })
        .collect()
}

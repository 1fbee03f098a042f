//! Typed service registry.
//!
//! A service lists its callable methods into a [`MethodTable`]. Each entry
//! records the method's parameter kinds, derived from the Rust parameter types
//! through [`Param`], and an erased invoker that coerces the positional JSON
//! arguments before calling the method. Results are turned back into a list
//! of JSON values through [`Returns`].
//!
//! ```
//! use knot_rpc::{MethodTable, Registry, Service};
//!
//! struct Greeter;
//!
//! impl Greeter {
//!     fn greet(&self, name: String) -> String {
//!         format!("hello {name}")
//!     }
//! }
//!
//! impl Service for Greeter {
//!     fn methods(table: &mut MethodTable<Self>) {
//!         table.method("Greet", Self::greet);
//!     }
//! }
//!
//! let mut registry = Registry::new();
//! registry.register(Greeter);
//!
//! let result = registry.dispatch(br#"["Greeter.Greet", "knot"]"#).unwrap();
//! assert_eq!(result, vec![serde_json::json!("hello knot")]);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::error::{RpcError, RpcResult};

/// Kind a positional argument is coerced to before invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// JSON boolean.
    Bool,
    /// Signed integer. Fractional numbers are truncated toward zero.
    Int,
    /// Unsigned integer. Negative numbers never convert.
    Uint,
    /// Floating point number.
    Float,
    /// JSON string.
    String,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
    /// Any JSON value, passed through unchanged.
    Any,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// A type a method parameter can be decoded into.
pub trait Param: Sized {
    /// Declared kind of the parameter.
    const KIND: ParamKind;

    /// Coerce a JSON value, or `None` if it does not convert.
    fn from_value(value: &Value) -> Option<Self>;
}

impl Param for bool {
    const KIND: ParamKind = ParamKind::Bool;

    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

/// Integral part of a JSON number, truncated toward zero.
#[allow(clippy::cast_possible_truncation)]
fn integral(number: &Number) -> Option<i128> {
    if let Some(i) = number.as_i64() {
        return Some(i128::from(i));
    }
    if let Some(u) = number.as_u64() {
        return Some(i128::from(u));
    }

    let truncated = number.as_f64()?.trunc();
    // Anything past 2^64 is out of range for every integer kind anyway.
    if !truncated.is_finite() || truncated.abs() > 18_446_744_073_709_551_616.0 {
        return None;
    }
    Some(truncated as i128)
}

fn is_negative(number: &Number) -> bool {
    number.as_f64().is_some_and(|f| f < 0.0)
}

macro_rules! impl_int_param {
    ($kind:ident, $signed:literal: $($ty:ty),+) => {
        $(
            impl Param for $ty {
                const KIND: ParamKind = ParamKind::$kind;

                fn from_value(value: &Value) -> Option<Self> {
                    let Value::Number(number) = value else {
                        return None;
                    };
                    if !$signed && is_negative(number) {
                        return None;
                    }
                    integral(number).and_then(|n| <$ty>::try_from(n).ok())
                }
            }
        )+
    };
}

impl_int_param!(Int, true: i8, i16, i32, i64, isize);
impl_int_param!(Uint, false: u8, u16, u32, u64, usize);

impl Param for f64 {
    const KIND: ParamKind = ParamKind::Float;

    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl Param for f32 {
    const KIND: ParamKind = ParamKind::Float;

    #[allow(clippy::cast_possible_truncation)]
    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64().map(|f| f as Self)
    }
}

impl Param for String {
    const KIND: ParamKind = ParamKind::String;

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl<T: Param> Param for Vec<T> {
    const KIND: ParamKind = ParamKind::Array;

    fn from_value(value: &Value) -> Option<Self> {
        value.as_array()?.iter().map(T::from_value).collect()
    }
}

impl Param for Map<String, Value> {
    const KIND: ParamKind = ParamKind::Object;

    fn from_value(value: &Value) -> Option<Self> {
        value.as_object().cloned()
    }
}

impl<T: Param> Param for HashMap<String, T> {
    const KIND: ParamKind = ParamKind::Object;

    fn from_value(value: &Value) -> Option<Self> {
        value
            .as_object()?
            .iter()
            .map(|(key, value)| Some((key.clone(), T::from_value(value)?)))
            .collect()
    }
}

impl<T: Param> Param for BTreeMap<String, T> {
    const KIND: ParamKind = ParamKind::Object;

    fn from_value(value: &Value) -> Option<Self> {
        value
            .as_object()?
            .iter()
            .map(|(key, value)| Some((key.clone(), T::from_value(value)?)))
            .collect()
    }
}

impl Param for Value {
    const KIND: ParamKind = ParamKind::Any;

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

/// What a method hands back: zero, one or several values.
pub trait Returns {
    /// Encode the result as the list of values sent back to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be serialized.
    fn into_values(self) -> serde_json::Result<Vec<Value>>;
}

impl Returns for () {
    fn into_values(self) -> serde_json::Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

/// Return an arbitrary serializable type as a single value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T: Serialize> Returns for Json<T> {
    fn into_values(self) -> serde_json::Result<Vec<Value>> {
        Ok(vec![serde_json::to_value(self.0)?])
    }
}

macro_rules! impl_single_returns {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Returns for $ty {
                fn into_values(self) -> serde_json::Result<Vec<Value>> {
                    Ok(vec![serde_json::to_value(self)?])
                }
            }
        )+
    };
}

impl_single_returns!(
    bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, String, &'static str,
    Value, Map<String, Value>,
);

impl<T: Serialize> Returns for Vec<T> {
    fn into_values(self) -> serde_json::Result<Vec<Value>> {
        Ok(vec![serde_json::to_value(self)?])
    }
}

impl<T: Serialize> Returns for Option<T> {
    fn into_values(self) -> serde_json::Result<Vec<Value>> {
        Ok(vec![serde_json::to_value(self)?])
    }
}

impl<T: Serialize> Returns for HashMap<String, T> {
    fn into_values(self) -> serde_json::Result<Vec<Value>> {
        Ok(vec![serde_json::to_value(self)?])
    }
}

macro_rules! impl_tuple_returns {
    ($($ty:ident $value:ident),+) => {
        impl<$($ty: Serialize),+> Returns for ($($ty,)+) {
            fn into_values(self) -> serde_json::Result<Vec<Value>> {
                let ($($value,)+) = self;
                Ok(vec![$(serde_json::to_value($value)?),+])
            }
        }
    };
}

impl_tuple_returns!(A a, B b);
impl_tuple_returns!(A a, B b, C c);
impl_tuple_returns!(A a, B b, C c, D d);

fn argument<T: Param>(args: &[Value], index: usize) -> RpcResult<T> {
    let value = args.get(index).ok_or(RpcError::MissingArgument {
        index,
        expected: T::KIND,
    })?;
    T::from_value(value).ok_or_else(|| RpcError::ArgumentMismatch {
        index,
        expected: T::KIND,
        value: value.clone(),
    })
}

/// A function callable as a method of `S` with positional arguments `Args`.
///
/// Implemented for `Fn(&S, A1, .., An) -> R` with up to four [`Param`]
/// arguments and an `R` implementing [`Returns`].
pub trait Method<S, Args>: Send + Sync + 'static {
    /// Parameter kinds, in order.
    fn params() -> Vec<ParamKind>;

    /// Coerce `args` and call the method on `receiver`.
    ///
    /// # Errors
    ///
    /// Returns an error if an argument is missing or does not convert, or if
    /// the result cannot be encoded.
    fn invoke(&self, receiver: &S, args: &[Value]) -> RpcResult<Vec<Value>>;
}

macro_rules! impl_method {
    ($($ty:ident $value:ident $index:literal),*) => {
        impl<S, F, R, $($ty),*> Method<S, ($($ty,)*)> for F
        where
            F: Fn(&S, $($ty),*) -> R + Send + Sync + 'static,
            R: Returns,
            $($ty: Param,)*
        {
            fn params() -> Vec<ParamKind> {
                vec![$($ty::KIND),*]
            }

            #[allow(unused_variables)]
            fn invoke(&self, receiver: &S, args: &[Value]) -> RpcResult<Vec<Value>> {
                $(let $value = argument::<$ty>(args, $index)?;)*
                (self)(receiver, $($value),*)
                    .into_values()
                    .map_err(RpcError::ResultEncoding)
            }
        }
    };
}

impl_method!();
impl_method!(A a 0);
impl_method!(A a 0, B b 1);
impl_method!(A a 0, B b 1, C c 2);
impl_method!(A a 0, B b 1, C c 2, D d 3);

type Invoke<S> = Box<dyn Fn(&S, &[Value]) -> RpcResult<Vec<Value>> + Send + Sync>;

/// One callable method: its parameter kinds and an erased invoker.
pub struct MethodDescriptor<S> {
    params: Vec<ParamKind>,
    invoke: Invoke<S>,
}

impl<S> MethodDescriptor<S> {
    /// Parameter kinds, in order.
    #[must_use]
    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    /// Call the method on `receiver`.
    ///
    /// # Errors
    ///
    /// See [`Method::invoke`].
    pub fn call(&self, receiver: &S, args: &[Value]) -> RpcResult<Vec<Value>> {
        (self.invoke)(receiver, args)
    }
}

impl<S> fmt::Debug for MethodDescriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Methods of a service, by exact name.
pub struct MethodTable<S> {
    methods: HashMap<&'static str, MethodDescriptor<S>>,
}

impl<S: 'static> MethodTable<S> {
    fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Expose `method` under `name`. A later entry with the same name wins.
    pub fn method<Args, M>(&mut self, name: &'static str, method: M) -> &mut Self
    where
        M: Method<S, Args>,
    {
        let descriptor = MethodDescriptor {
            params: M::params(),
            invoke: Box::new(move |receiver: &S, args: &[Value]| method.invoke(receiver, args)),
        };
        self.methods.insert(name, descriptor);
        self
    }

    /// Look up a method.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MethodDescriptor<S>> {
        self.methods.get(name)
    }

    /// Number of methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the table has no methods.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// A receiver whose methods can be called remotely.
pub trait Service: Send + Sync + Sized + 'static {
    /// Name the service is registered under.
    ///
    /// Defaults to the type's name without module path or generics.
    #[must_use]
    fn name() -> String {
        type_name_of::<Self>()
    }

    /// List the callable methods.
    fn methods(table: &mut MethodTable<Self>);
}

fn type_name_of<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

trait ErasedService: Send + Sync {
    fn call(&self, method: &str, args: &[Value]) -> Option<RpcResult<Vec<Value>>>;

    fn params(&self, method: &str) -> Option<&[ParamKind]>;
}

struct Registered<S> {
    receiver: S,
    table: MethodTable<S>,
}

impl<S: Service> ErasedService for Registered<S> {
    fn call(&self, method: &str, args: &[Value]) -> Option<RpcResult<Vec<Value>>> {
        self.table
            .get(method)
            .map(|descriptor| descriptor.call(&self.receiver, args))
    }

    fn params(&self, method: &str) -> Option<&[ParamKind]> {
        self.table.get(method).map(MethodDescriptor::params)
    }
}

/// Services by name.
///
/// Built before serving and read-only afterwards.
#[derive(Default)]
pub struct Registry {
    services: HashMap<String, Arc<dyn ErasedService>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `receiver` under [`Service::name`], replacing any service of that name.
    pub fn register<S: Service>(&mut self, receiver: S) {
        let name = S::name();
        let mut table = MethodTable::new();
        S::methods(&mut table);

        debug!(service = %name, methods = table.len(), "registered service");
        let previous = self
            .services
            .insert(name.clone(), Arc::new(Registered { receiver, table }));
        if previous.is_some() {
            debug!(service = %name, "replaced previously registered service");
        }
    }

    /// Whether a service is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Parameter kinds of `service.method`.
    #[must_use]
    pub fn params(&self, service: &str, method: &str) -> Option<&[ParamKind]> {
        self.services.get(service)?.params(method)
    }

    /// Decode a call envelope and invoke the method it names.
    ///
    /// The body must be a JSON array whose first element is `"Service.Method"`;
    /// the rest are positional arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is malformed, the method is unknown,
    /// an argument does not convert, or the result cannot be encoded.
    pub fn dispatch(&self, body: &[u8]) -> RpcResult<Vec<Value>> {
        let envelope: Vec<Value> = serde_json::from_slice(body)?;
        let (reference, args) = envelope.split_first().ok_or(RpcError::EmptyEnvelope)?;
        let reference = reference
            .as_str()
            .ok_or_else(|| RpcError::MethodNotString(reference.clone()))?;
        let (service, method) = reference
            .rsplit_once('.')
            .ok_or_else(|| RpcError::MissingSeparator(reference.to_string()))?;

        let target = self
            .services
            .get(service)
            .ok_or_else(|| RpcError::UnknownService(service.to_string()))?;

        target
            .call(method, args)
            .unwrap_or_else(|| {
                Err(RpcError::UnknownMethod {
                    service: service.to_string(),
                    method: method.to_string(),
                })
            })
    }
}

//! Handler binding and signature validation.
//!
//! A handler is an async callable that consumes one decoded payload:
//!
//! ```ignore
//! async fn on_created(ctx: Context, order: OrderEvent) -> anyhow::Result<()>;
//! async fn on_ping(ping: Ping) -> anyhow::Result<()>;
//! ```
//!
//! There are three ways to describe one:
//!
//! - **Single callable**: [`handler_fn`] turns a closure or `async fn` into a
//!   [`HandlerSpec`] named `Func`.
//! - **Object with methods**: [`Methods`] collects several named callables
//!   under one owner name (`OrderService.on_created`). Types can implement
//!   [`IntoHandlers`] to expose their methods this way.
//! - **Raw**: [`HandlerSpec::from_parts`] takes an explicit [`Signature`], a
//!   payload factory and an invocation closure. Bridges that only know the
//!   handler's shape at runtime use this path.
//!
//! Every spec is checked by [`Signature::validate`] before anything is
//! registered. The typed paths always produce valid signatures: their payload
//! argument is a concrete `Payload` type whose name is always exported. The
//! raw path is the only place where violations can surface. That includes
//! the unexported-argument check, which only fires for hand-written
//! signatures naming an anonymous type (empty, or a `{{closure}}` name).

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::FutureExt;

use crate::codec::Payload;
use crate::context::Context;
use crate::error::PubSubError;

/// Required handler shape, quoted in validation errors.
pub const HANDLER_SIGNATURE: &str = "fn(Context, Payload) -> Result<()>";

/// Name given to handlers bound from a single callable.
pub const FUNC_NAME: &str = "Func";

/// Future returned by every handler invocation.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Allocates a fresh, empty payload of a handler's type.
pub type PayloadFactory = Arc<dyn Fn() -> Box<dyn Payload> + Send + Sync>;

/// Invokes a handler. The context is `Some` only for handlers that take one.
pub type InvokeFn =
    Arc<dyn Fn(Option<Context>, Box<dyn Payload>) -> HandlerFuture + Send + Sync>;

// =============================================================================
// Signature
// =============================================================================

/// One input parameter of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    /// The execution context.
    Context,
    /// A payload value of the named type.
    Value(String),
}

/// One output of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// An error result.
    Error,
    /// Any other value, by type name.
    Value(String),
}

/// Declared shape of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Input parameters, in order.
    pub inputs: Vec<Param>,
    /// Outputs, in order.
    pub outputs: Vec<Output>,
}

impl Signature {
    /// An arbitrary signature.
    pub fn new(inputs: Vec<Param>, outputs: Vec<Output>) -> Self {
        Self { inputs, outputs }
    }

    /// The canonical shape: optional context, one payload, one error output.
    pub fn handler(payload_type: impl Into<String>, with_context: bool) -> Self {
        let mut inputs = Vec::with_capacity(2);
        if with_context {
            inputs.push(Param::Context);
        }
        inputs.push(Param::Value(payload_type.into()));
        Self {
            inputs,
            outputs: vec![Output::Error],
        }
    }

    /// Check the signature against the handler rules.
    ///
    /// `name` is the qualified handler name used in error text.
    pub fn validate(&self, name: &str) -> Result<(), PubSubError> {
        let invalid = |reason: String| PubSubError::InvalidHandler {
            handler: name.to_string(),
            reason,
        };

        let payload = match self.inputs.as_slice() {
            [payload] => payload,
            [Param::Context, payload] => payload,
            [first, _] => {
                return Err(invalid(format!(
                    "subscriber {name} first argument is {} not Context: required signature {HANDLER_SIGNATURE}",
                    param_type(first)
                )))
            }
            other => {
                return Err(invalid(format!(
                    "subscriber {name} takes wrong number of args: {} required signature {HANDLER_SIGNATURE}",
                    other.len()
                )))
            }
        };

        match payload {
            Param::Value(ty) if is_nameable(ty) => {}
            other => {
                return Err(invalid(format!(
                    "subscriber {name} argument type not exported: {}",
                    param_type(other)
                )))
            }
        }

        match self.outputs.as_slice() {
            [Output::Error] => Ok(()),
            [Output::Value(ty)] => Err(invalid(format!(
                "subscriber {name} returns {ty} not error"
            ))),
            other => Err(invalid(format!(
                "subscriber {name} has wrong number of outs: {} require signature {HANDLER_SIGNATURE}",
                other.len()
            ))),
        }
    }

    fn wants_context(&self) -> bool {
        self.inputs.len() == 2
    }

    fn payload_type(&self) -> &str {
        match self.inputs.last() {
            Some(Param::Value(ty)) => ty,
            _ => "",
        }
    }
}

fn param_type(param: &Param) -> &str {
    match param {
        Param::Context => "Context",
        Param::Value(ty) => ty,
    }
}

/// Closures and other anonymous types have no usable name.
fn is_nameable(ty: &str) -> bool {
    !ty.is_empty() && !ty.contains("{{")
}

// =============================================================================
// Handler Spec (unvalidated)
// =============================================================================

/// An unvalidated handler description.
#[derive(Clone)]
pub struct HandlerSpec {
    name: String,
    signature: Signature,
    factory: PayloadFactory,
    invoke: InvokeFn,
}

impl HandlerSpec {
    /// Describe a handler explicitly.
    ///
    /// `factory` must produce values of the payload type named in
    /// `signature`; `invoke` receives them.
    pub fn from_parts(
        name: impl Into<String>,
        signature: Signature,
        factory: PayloadFactory,
        invoke: InvokeFn,
    ) -> Self {
        Self {
            name: name.into(),
            signature,
            factory,
            invoke,
        }
    }

    /// Qualified handler name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    fn validate(self) -> Result<Handler, PubSubError> {
        self.signature.validate(&self.name)?;
        Ok(Handler {
            name: self.name.into(),
            payload_type: self.signature.payload_type().into(),
            wants_context: self.signature.wants_context(),
            factory: self.factory,
            invoke: self.invoke,
        })
    }
}

impl fmt::Debug for HandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

// =============================================================================
// Handler (validated)
// =============================================================================

/// A validated, bound handler.
#[derive(Clone)]
pub struct Handler {
    name: Arc<str>,
    payload_type: Arc<str>,
    wants_context: bool,
    factory: PayloadFactory,
    invoke: InvokeFn,
}

impl Handler {
    /// Qualified handler name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type name of the payload this handler consumes.
    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    /// Whether the handler takes a leading context argument.
    pub fn wants_context(&self) -> bool {
        self.wants_context
    }

    /// Allocate an empty payload to decode into.
    pub fn new_payload(&self) -> Box<dyn Payload> {
        (self.factory)()
    }

    /// Invoke the handler.
    pub fn call(&self, ctx: Context, payload: Box<dyn Payload>) -> HandlerFuture {
        let ctx = self.wants_context.then_some(ctx);
        (self.invoke)(ctx, payload)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("payload_type", &self.payload_type)
            .field("wants_context", &self.wants_context)
            .finish()
    }
}

// =============================================================================
// Typed Callables
// =============================================================================

/// Marker for `Fn(T) -> Fut` handlers.
pub struct PayloadOnly<T>(PhantomData<fn(T)>);

/// Marker for `Fn(Context, T) -> Fut` handlers.
pub struct WithContext<T>(PhantomData<fn(T)>);

/// An async callable usable as a handler.
///
/// The `Marker` parameter only disambiguates the supported arities; it is
/// inferred.
pub trait HandlerFn<Marker>: Send + Sync + 'static {
    /// Describe this callable under `name`.
    fn into_spec(self, name: String) -> HandlerSpec;
}

impl<F, Fut, T> HandlerFn<PayloadOnly<T>> for F
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    T: Payload + Default,
{
    fn into_spec(self, name: String) -> HandlerSpec {
        let f = self;
        let invoke: InvokeFn = Arc::new(
            move |_ctx: Option<Context>, payload: Box<dyn Payload>| -> HandlerFuture {
                match downcast::<T>(payload) {
                    Ok(value) => f(value).boxed(),
                    Err(e) => future::ready(Err(e.into())).boxed(),
                }
            },
        );
        HandlerSpec::from_parts(
            name,
            Signature::handler(type_name::<T>(), false),
            factory::<T>(),
            invoke,
        )
    }
}

impl<F, Fut, T> HandlerFn<WithContext<T>> for F
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    T: Payload + Default,
{
    fn into_spec(self, name: String) -> HandlerSpec {
        let f = self;
        let invoke: InvokeFn = Arc::new(
            move |ctx: Option<Context>, payload: Box<dyn Payload>| -> HandlerFuture {
                match downcast::<T>(payload) {
                    Ok(value) => f(ctx.unwrap_or_default(), value).boxed(),
                    Err(e) => future::ready(Err(e.into())).boxed(),
                }
            },
        );
        HandlerSpec::from_parts(
            name,
            Signature::handler(type_name::<T>(), true),
            factory::<T>(),
            invoke,
        )
    }
}

fn factory<T: Payload + Default>() -> PayloadFactory {
    Arc::new(|| Box::new(T::default()) as Box<dyn Payload>)
}

fn downcast<T: Payload>(payload: Box<dyn Payload>) -> Result<T, PubSubError> {
    let actual = payload.type_name();
    payload
        .into_any()
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| PubSubError::PayloadMismatch {
            expected: type_name::<T>(),
            actual,
        })
}

/// Bind a single callable.
///
/// # Example
///
/// ```ignore
/// engine
///     .register_subscriber("orders.created", handler_fn(on_created), SubscriberOptions::default())
///     .await?;
/// ```
pub fn handler_fn<M, F: HandlerFn<M>>(f: F) -> HandlerSpec {
    f.into_spec(FUNC_NAME.to_string())
}

// =============================================================================
// Methods (object path)
// =============================================================================

/// Several named callables bound under one owner.
///
/// # Example
///
/// ```ignore
/// let handlers = Methods::new("OrderService")
///     .method("on_created", move |ctx, order: OrderEvent| svc.clone().created(ctx, order))
///     .method("audit", |order: OrderEvent| async move { audit(order).await });
/// ```
#[derive(Debug, Clone)]
pub struct Methods {
    owner: String,
    specs: Vec<HandlerSpec>,
}

impl Methods {
    /// Start collecting methods for `owner`.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            specs: Vec::new(),
        }
    }

    /// Add a typed method.
    pub fn method<M, F: HandlerFn<M>>(mut self, name: &str, f: F) -> Self {
        let qualified = format!("{}.{}", self.owner, name);
        self.specs.push(f.into_spec(qualified));
        self
    }

    /// Add a raw method. Its name is qualified with the owner.
    pub fn raw(mut self, mut spec: HandlerSpec) -> Self {
        spec.name = format!("{}.{}", self.owner, spec.name);
        self.specs.push(spec);
        self
    }

    /// Owner name.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// Anything that can be bound to a topic.
pub trait IntoHandlers {
    /// Produce the ordered handler descriptions.
    fn into_handlers(self) -> Vec<HandlerSpec>;
}

impl IntoHandlers for HandlerSpec {
    fn into_handlers(self) -> Vec<HandlerSpec> {
        vec![self]
    }
}

impl IntoHandlers for Methods {
    fn into_handlers(self) -> Vec<HandlerSpec> {
        self.specs
    }
}

impl IntoHandlers for Vec<HandlerSpec> {
    fn into_handlers(self) -> Vec<HandlerSpec> {
        self
    }
}

/// Validate and bind handlers for `topic`.
///
/// Fails on the first invalid handler; nothing is bound in that case.
pub fn bind(topic: &str, handlers: impl IntoHandlers) -> Result<Arc<[Handler]>, PubSubError> {
    let specs = handlers.into_handlers();
    if specs.is_empty() {
        return Err(PubSubError::NoHandlers {
            topic: topic.to_string(),
        });
    }

    specs
        .into_iter()
        .map(HandlerSpec::validate)
        .collect::<Result<Vec<_>, _>>()
        .map(Arc::from)
}

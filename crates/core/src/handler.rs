//! Handler contract and closure adapters.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::args::FromArgs;
use crate::error::{HandlerError, HandlerResult};
use crate::message::Message;

/// Processes one reserved message.
///
/// Returning an error drives the retry/fallback state machine; an
/// argument-mismatch error makes the processor drop the message instead.
pub trait Handler: Send + Sync {
    fn handle_message(&self, msg: &Message) -> HandlerResult;
}

impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    fn handle_message(&self, msg: &Message) -> HandlerResult {
        (**self).handle_message(msg)
    }
}

/// Return types a handler closure may use.
pub trait IntoHandlerResult {
    fn into_handler_result(self) -> HandlerResult;
}

impl IntoHandlerResult for () {
    fn into_handler_result(self) -> HandlerResult {
        Ok(())
    }
}

impl<E> IntoHandlerResult for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_handler_result(self) -> HandlerResult {
        self.map_err(|e| HandlerError::Failed(e.into()))
    }
}

/// A closure taking typed positional arguments.
///
/// Implemented for `Fn(A, B, ..) -> R` up to eight parameters, where every
/// parameter is `DeserializeOwned` and `R` is `()` or a `Result`.
pub trait ArgsFn<Args>: Send + Sync + 'static {
    fn call_with(&self, args: &[Value]) -> HandlerResult;
}

macro_rules! impl_args_fn {
    ($($ty:ident),*) => {
        impl<F, R, $($ty,)*> ArgsFn<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> R + Send + Sync + 'static,
            R: IntoHandlerResult,
            $($ty: DeserializeOwned,)*
        {
            #[allow(non_snake_case)]
            fn call_with(&self, args: &[Value]) -> HandlerResult {
                let ($($ty,)*) = <($($ty,)*) as FromArgs>::from_args(args)?;
                (self)($($ty),*).into_handler_result()
            }
        }
    };
}

impl_args_fn!();
impl_args_fn!(A);
impl_args_fn!(A, B);
impl_args_fn!(A, B, C);
impl_args_fn!(A, B, C, D);
impl_args_fn!(A, B, C, D, E);
impl_args_fn!(A, B, C, D, E, G);
impl_args_fn!(A, B, C, D, E, G, H);
impl_args_fn!(A, B, C, D, E, G, H, I);

/// Handler built from a typed closure; see [`handler_fn`].
pub struct FnHandler<F, Args> {
    f: F,
    _args: PhantomData<fn(Args)>,
}

impl<F, Args> Handler for FnHandler<F, Args>
where
    F: ArgsFn<Args>,
{
    fn handle_message(&self, msg: &Message) -> HandlerResult {
        self.f.call_with(&msg.args)
    }
}

/// Wrap a closure over typed arguments:
///
/// ```ignore
/// let h = handler_fn(|user: String, amount: i64| -> anyhow::Result<()> { .. });
/// ```
///
/// Messages whose arguments do not bind to the closure's parameters are
/// reported as a mismatch and never reach the closure.
pub fn handler_fn<Args, F>(f: F) -> FnHandler<F, Args>
where
    F: ArgsFn<Args>,
{
    FnHandler {
        f,
        _args: PhantomData,
    }
}

/// Handler built from a closure over the raw message; see [`message_handler`].
pub struct MessageFn<F> {
    f: F,
}

impl<F, R> Handler for MessageFn<F>
where
    F: Fn(&Message) -> R + Send + Sync,
    R: IntoHandlerResult,
{
    fn handle_message(&self, msg: &Message) -> HandlerResult {
        (self.f)(msg).into_handler_result()
    }
}

/// Wrap a closure that wants the whole message rather than its arguments.
pub fn message_handler<F, R>(f: F) -> MessageFn<F>
where
    F: Fn(&Message) -> R + Send + Sync,
    R: IntoHandlerResult,
{
    MessageFn { f }
}

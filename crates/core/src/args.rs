//! Positional argument codec.
//!
//! Producers hand over any tuple of `Serialize` values; handlers declare the
//! parameter types they expect. Both sides meet on a list of JSON values, which
//! is what travels in a message body.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::HandlerError;

/// Converts producer-side values into a message argument list.
pub trait IntoArgs {
    fn into_args(self) -> Result<Vec<Value>, serde_json::Error>;
}

/// Binds a message argument list to typed handler parameters.
///
/// Binding fails when the count differs or any value does not decode into
/// the expected type.
pub trait FromArgs: Sized {
    /// Number of parameters the binding expects.
    const ARITY: usize;

    fn from_args(args: &[Value]) -> Result<Self, HandlerError>;
}

impl IntoArgs for Vec<Value> {
    fn into_args(self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(self)
    }
}

fn bind<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, HandlerError> {
    serde_json::from_value(args[index].clone())
        .map_err(|source| HandlerError::ArgType { index, source })
}

macro_rules! impl_args_for_tuple {
    ($n:expr; $($ty:ident => $idx:tt),*) => {
        impl<$($ty: Serialize,)*> IntoArgs for ($($ty,)*) {
            #[allow(unused_mut)]
            fn into_args(self) -> Result<Vec<Value>, serde_json::Error> {
                let mut args = Vec::with_capacity($n);
                $(args.push(serde_json::to_value(&self.$idx)?);)*
                Ok(args)
            }
        }

        impl<$($ty: DeserializeOwned,)*> FromArgs for ($($ty,)*) {
            const ARITY: usize = $n;

            #[allow(unused_variables)]
            fn from_args(args: &[Value]) -> Result<Self, HandlerError> {
                if args.len() != $n {
                    return Err(HandlerError::ArgCount { expected: $n, found: args.len() });
                }
                Ok(($(bind::<$ty>(args, $idx)?,)*))
            }
        }
    };
}

impl_args_for_tuple!(0;);
impl_args_for_tuple!(1; A => 0);
impl_args_for_tuple!(2; A => 0, B => 1);
impl_args_for_tuple!(3; A => 0, B => 1, C => 2);
impl_args_for_tuple!(4; A => 0, B => 1, C => 2, D => 3);
impl_args_for_tuple!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
impl_args_for_tuple!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);
impl_args_for_tuple!(7; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6);
impl_args_for_tuple!(8; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tuples_become_positional_values() {
        let args = ("string", 42).into_args().unwrap();
        assert_eq!(args, vec![json!("string"), json!(42)]);
        assert!(().into_args().unwrap().is_empty());
    }

    #[test]
    fn binds_matching_arguments() {
        let (s, i) = <(String, i64)>::from_args(&[json!("string"), json!(42)]).unwrap();
        assert_eq!(s, "string");
        assert_eq!(i, 42);
    }

    #[test]
    fn rejects_wrong_count() {
        let err = <(String,)>::from_args(&[]).unwrap_err();
        assert!(matches!(err, HandlerError::ArgCount { expected: 1, found: 0 }));
    }

    #[test]
    fn rejects_wrong_type() {
        let err = <(i64,)>::from_args(&[json!("not a number")]).unwrap_err();
        assert!(matches!(err, HandlerError::ArgType { index: 0, .. }));
        assert!(err.is_args_mismatch());
    }
}

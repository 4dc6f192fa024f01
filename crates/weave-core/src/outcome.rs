//! A value-or-error wrapper used to deliver resumption results to suspended tasks.

use std::fmt;

/// Tagged union of a successful value or an error, used throughout the runtime
/// to hand a result back across a suspension point without unwinding through it.
pub enum Outcome<T, E> {
    Value(T),
    Error(E),
}

impl<T, E> Outcome<T, E> {
    /// Run a closure and capture whatever it produces as an `Outcome`.
    pub fn capture<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, E>,
    {
        match f() {
            Ok(v) => Outcome::Value(v),
            Err(e) => Outcome::Error(e),
        }
    }

    /// Unwrap into a `Result`, the inverse of `capture`.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Error(e) => Err(e),
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

impl<T, E> fmt::Debug for Outcome<T, E>
where
    T: fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Outcome::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(r: Result<T, E>) -> Self {
        Outcome::capture(|| r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_roundtrips_through_result() {
        let ok: Outcome<i32, &str> = Outcome::capture(|| Ok(7));
        assert!(ok.is_value());
        assert_eq!(ok.into_result(), Ok(7));

        let err: Outcome<i32, &str> = Outcome::capture(|| Err("boom"));
        assert!(err.is_error());
        assert_eq!(err.into_result(), Err("boom"));
    }
}

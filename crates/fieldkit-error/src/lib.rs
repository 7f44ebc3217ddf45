//! Error taxonomy for `fieldkit`.
//!
//! Configuration errors are programmer faults (undeclared variables, shape
//! mismatches, non-positive counting numbers) and are meant to abort
//! immediately. Non-convergence of inference is never an error: it is an
//! observable field on the inference result. Failures returned by an
//! external minimizer are wrapped and surfaced to the caller untouched.

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::ops::Deref;

#[cfg(feature = "backtrace")]
use std::backtrace::Backtrace;

pub type FieldResult<T> = Result<T, FieldError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidConfig,
    InvalidParameter,
    Optimization,
    Multiple,
    Context,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrString(Cow<'static, str>);

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ErrString {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<T: Into<Cow<'static, str>>> From<T> for ErrString {
    fn from(v: T) -> Self {
        Self(v.into())
    }
}

/// Error produced by the model, inference, or learning layers.
///
/// `Optimization` wraps a failure bubbled up from the caller-supplied
/// [`Minimizer`](fieldkit_learn) untouched, per the delegated-failure policy.
#[derive(Debug)]
pub enum FieldError {
    InvalidConfig {
        message: ErrString,
    },
    InvalidParameter {
        message: ErrString,
    },
    Optimization {
        message: ErrString,
    },

    Multiple(MultiDisplay),

    Context {
        context: ErrorContext,
        source: Box<FieldError>,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
}

impl FieldError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            Self::Optimization { .. } => ErrorCode::Optimization,
            Self::Multiple(_) => ErrorCode::Multiple,
            Self::Context { .. } => ErrorCode::Context,
        }
    }

    pub fn with_context(self, msg: impl Into<String>) -> Self {
        FieldError::Context {
            context: ErrorContext::new(msg),
            source: Box::new(self),
            #[cfg(feature = "backtrace")]
            backtrace: Backtrace::capture(),
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { message } => write!(f, "invalid configuration: {}", message),
            Self::InvalidParameter { message } => write!(f, "invalid parameter: {}", message),
            Self::Optimization { message } => write!(f, "optimizer failure: {}", message),
            Self::Multiple(m) => write!(f, "multiple errors:\n{}", m),
            Self::Context { context, source, .. } => write!(f, "{}\nCaused by: {}", context, source),
        }
    }
}

impl std::error::Error for FieldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Context { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ErrorContext {
    message: String,
}

impl ErrorContext {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl Display for ErrorContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ErrorContext {}

#[derive(Debug)]
pub struct MultiDisplay(Vec<FieldError>);

impl Display for MultiDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "[{}] {} (code: {:?})", i, e, e.code())?;
        }
        Ok(())
    }
}

impl From<Vec<FieldError>> for MultiDisplay {
    fn from(v: Vec<FieldError>) -> Self {
        Self(v)
    }
}

pub trait ResultExt<T> {
    fn context(self, msg: impl Into<String>) -> FieldResult<T>;
    fn with_context<F: FnOnce() -> String>(self, f: F) -> FieldResult<T>;
}

impl<T, E: Into<FieldError>> ResultExt<T> for Result<T, E> {
    fn context(self, msg: impl Into<String>) -> FieldResult<T> {
        self.map_err(|e| e.into().with_context(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> FieldResult<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[doc(hidden)]
pub mod __private {
    #[inline]
    #[cold]
    #[must_use]
    pub fn must_use<E>(e: E) -> E {
        e
    }
}

#[macro_export]
macro_rules! field_err {
    (InvalidConfig: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::__private::must_use($crate::FieldError::InvalidConfig { message: format!($fmt, $($arg),*).into() })
    };
    (InvalidParameter: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::__private::must_use($crate::FieldError::InvalidParameter { message: format!($fmt, $($arg),*).into() })
    };
    (Optimization: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::__private::must_use($crate::FieldError::Optimization { message: format!($fmt, $($arg),*).into() })
    };
}

#[macro_export]
macro_rules! field_bail {
    ($($tt:tt)+) => { return Err($crate::field_err!($($tt)+)) };
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($tt:tt)+) => {
        if !$cond { $crate::field_bail!($($tt)+); }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_chains_display() {
        let base = field_err!(InvalidConfig: "variable {} undeclared", 3);
        let wrapped = base.with_context("while building unary matrix");
        let msg = wrapped.to_string();
        assert!(msg.contains("variable 3 undeclared"));
        assert!(msg.contains("while building unary matrix"));
    }

    #[test]
    fn code_reflects_variant() {
        let e = field_err!(InvalidParameter: "counting number must be positive");
        assert_eq!(e.code(), ErrorCode::InvalidParameter);
    }
}

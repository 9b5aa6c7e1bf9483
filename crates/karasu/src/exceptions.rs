//! The built-in exception taxonomy.
//!
//! Every kind here gets a real class on the exception tree at boot, rooted
//! at `BaseException`; user code can subclass them freely. [`ExcKind`] is
//! the compile-time view the runtime uses to construct and classify the
//! builtin errors it raises itself.

use strum::{Display, EnumCount, EnumIter, IntoStaticStr};

use crate::value::Value;

/// Builtin exception kinds.
///
/// The variant name is the class name (`strum` `Display` renders it
/// as-is). `parent` encodes the single-inheritance tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumCount, EnumIter, IntoStaticStr)]
pub enum ExcKind {
    /// Root of the tree; `except BaseException` catches everything.
    BaseException,
    /// Base for everything a program normally catches.
    Exception,
    TypeError,
    ValueError,
    /// Raised for call-arity and keyword mismatch failures.
    ArgumentError,
    IndexError,
    KeyError,
    AttributeError,
    NameError,
    ImportError,
    OSError,
    /// Subclass of OSError kept for its historical spelling.
    IOError,
    NotImplementedError,
    ZeroDivisionError,
    SyntaxError,
    AssertionError,
    /// Raised by the SIGNALLED flag at the next instruction boundary;
    /// inherits from BaseException so bare `except:` does not eat it.
    KeyboardInterrupt,
    /// Internal faults: recursion limits, corrupt state, debugger quit.
    SystemError,
    ThreadError,
    StopIteration,
}

impl ExcKind {
    /// The parent class in the exception tree.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::Exception | Self::KeyboardInterrupt => Some(Self::BaseException),
            Self::IOError => Some(Self::OSError),
            _ => Some(Self::Exception),
        }
    }

    /// The class name as written in source.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Whether `self` would be caught by `except other:`.
    #[must_use]
    pub fn is_subkind_of(self, other: Self) -> bool {
        let mut cursor = Some(self);
        while let Some(kind) = cursor {
            if kind == other {
                return true;
            }
            cursor = kind.parent();
        }
        false
    }
}

/// A raised exception in flight.
///
/// The payload is the exception instance; its fields carry the message
/// (`arg`), the traceback list, and an optional `__cause__`. The VM
/// threads this through the dispatch loop as the `Err` arm of every
/// fallible operation.
#[derive(Debug, Clone, Copy)]
pub struct VmError {
    /// The exception instance (or, degenerately, any raised value).
    pub(crate) exception: Value,
}

impl VmError {
    #[must_use]
    pub(crate) fn new(exception: Value) -> Self {
        Self { exception }
    }

    /// The raised value. Embedders inspect it through the `Vm` accessors.
    #[must_use]
    pub fn value(&self) -> Value {
        self.exception
    }
}

/// Result alias used across the runtime.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_roots_at_base_exception() {
        use strum::IntoEnumIterator;
        for kind in ExcKind::iter() {
            assert!(kind.is_subkind_of(ExcKind::BaseException), "{kind} must reach the root");
        }
    }

    #[test]
    fn test_keyboard_interrupt_escapes_exception() {
        assert!(!ExcKind::KeyboardInterrupt.is_subkind_of(ExcKind::Exception));
        assert!(ExcKind::KeyboardInterrupt.is_subkind_of(ExcKind::BaseException));
    }

    #[test]
    fn test_io_error_is_os_error() {
        assert!(ExcKind::IOError.is_subkind_of(ExcKind::OSError));
        assert!(ExcKind::IOError.is_subkind_of(ExcKind::Exception));
        assert!(!ExcKind::OSError.is_subkind_of(ExcKind::IOError));
    }

    #[test]
    fn test_names_match_source_spelling() {
        assert_eq!(ExcKind::TypeError.name(), "TypeError");
        assert_eq!(ExcKind::ZeroDivisionError.name(), "ZeroDivisionError");
    }
}

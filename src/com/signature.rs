//! Runtime signature descriptors
//!
//! Signals and slots are generic over an argument tuple implementing
//! [`Args`]. Once type-erased (for example when stored in a
//! [`SlotTable`](crate::com::SlotTable)) the tuple's [`Signature`] is what the
//! connect-time compatibility check compares.

use std::any::{type_name, TypeId};
use std::fmt;

/// One argument or return type in a signature
#[derive(Debug, Clone, Copy)]
pub struct TypeDesc {
    id: TypeId,
    name: &'static str,
}

impl TypeDesc {
    /// Descriptor for `T`
    pub fn of<T: 'static>() -> Self {
        TypeDesc {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Type name as reported by the compiler
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeDesc {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeDesc {}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Ordered argument types plus return type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    args: Vec<TypeDesc>,
    ret: TypeDesc,
}

impl Signature {
    /// Signature of a callable taking `A` and returning `R`
    pub fn of<A: Args, R: 'static>() -> Self {
        Signature {
            args: A::types(),
            ret: TypeDesc::of::<R>(),
        }
    }

    /// Argument types, in order
    pub fn args(&self) -> &[TypeDesc] {
        &self.args
    }

    /// Return type
    pub fn ret(&self) -> TypeDesc {
        self.ret
    }

    /// Number of arguments
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Whether a slot with this signature can receive `emitted` arguments
    ///
    /// The slot's arguments must be a prefix of the emitted ones; trailing
    /// emitted arguments are dropped. Return types are ignored since signals
    /// discard slot results.
    pub fn accepts(&self, emitted: &Signature) -> bool {
        self.args.len() <= emitted.args.len()
            && self.args.iter().zip(&emitted.args).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fn(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Argument tuple carried by a signal or accepted by a slot
///
/// Implemented for tuples of up to four `Clone + Send + 'static` elements.
/// [`Prefix`](Args::Prefix) is the tuple without its last element, which is
/// how a slot taking fewer arguments is adapted to a wider signal.
pub trait Args: Clone + Send + 'static {
    /// Number of elements
    const ARITY: usize;

    /// Tuple with the last element removed (`()` stays `()`)
    type Prefix: Args;

    /// Drop the last element
    fn prefix(self) -> Self::Prefix;

    /// Element type descriptors, in order
    fn types() -> Vec<TypeDesc>;
}

impl Args for () {
    const ARITY: usize = 0;
    type Prefix = ();

    fn prefix(self) -> Self::Prefix {}

    fn types() -> Vec<TypeDesc> {
        Vec::new()
    }
}

macro_rules! impl_args {
    ($arity:expr; $($name:ident),+ ; $($prefix:ident),*) => {
        impl<$($name),+> Args for ($($name,)+)
        where
            $($name: Clone + Send + 'static),+
        {
            const ARITY: usize = $arity;
            type Prefix = ($($prefix,)*);

            #[allow(non_snake_case, unused_variables)]
            fn prefix(self) -> Self::Prefix {
                let ($($name,)+) = self;
                ($($prefix,)*)
            }

            fn types() -> Vec<TypeDesc> {
                vec![$(TypeDesc::of::<$name>()),+]
            }
        }
    };
}

impl_args!(1; A1; );
impl_args!(2; A1, A2; A1);
impl_args!(3; A1, A2, A3; A1, A2);
impl_args!(4; A1, A2, A3, A4; A1, A2, A3);

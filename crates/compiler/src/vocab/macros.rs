//! Table macro for the canonical vocabulary

/// Build one [`AttrSpec`](crate::vocab::AttrSpec)
///
/// ```text
/// attr_spec!("to": Str)                 // required
/// attr_spec!("alpha": Float = 1.0f32)   // defaulted
/// attr_spec!("perm": opt Ints)          // nullable
/// ```
macro_rules! attr_spec {
    ($name:literal : opt $kind:ident) => {
        $crate::vocab::AttrSpec {
            name: $name,
            kind: $crate::vocab::AttrKind::$kind,
            default: $crate::vocab::AttrDefault::Nullable,
        }
    };
    ($name:literal : $kind:ident = $default:expr) => {
        $crate::vocab::AttrSpec {
            name: $name,
            kind: $crate::vocab::AttrKind::$kind,
            default: $crate::vocab::AttrDefault::Value($crate::attrs::AttrValue::from($default)),
        }
    };
    ($name:literal : $kind:ident) => {
        $crate::vocab::AttrSpec {
            name: $name,
            kind: $crate::vocab::AttrKind::$kind,
            default: $crate::vocab::AttrDefault::Required,
        }
    };
}

/// Generate the `CanonicalOp` enum from one record per operator
///
/// # Syntax
///
/// ```text
/// define_canonical_ops! {
///     /// General matrix multiply
///     Gemm => "Gemm", inputs: 2..=3, outputs: 1,
///         attrs: [("alpha": Float = 1.0f32), ("transA": Int = 0i64)],
/// }
/// ```
///
/// Adding an operator is one record; the name table, arity checks and
/// schemas all follow from it.
macro_rules! define_canonical_ops {
    (
        $(
            $(#[$meta:meta])*
            $variant:ident => $name:literal,
                inputs: $min:literal ..= $max:literal,
                outputs: $outs:literal,
                attrs: [ $( ( $($spec:tt)* ) ),* $(,)? ]
        ),* $(,)?
    ) => {
        /// Operators of the canonical vocabulary
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CanonicalOp {
            $(
                $(#[$meta])*
                $variant,
            )*
        }

        impl CanonicalOp {
            /// Every canonical operator, in table order
            pub const ALL: &'static [CanonicalOp] = &[$(CanonicalOp::$variant),*];

            /// Operator name as emitted into the target program
            pub fn name(&self) -> &'static str {
                match self {
                    $(CanonicalOp::$variant => $name,)*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(CanonicalOp::$variant),)*
                    _ => None,
                }
            }

            /// Accepted operand count, inclusive
            pub fn arity(&self) -> (usize, usize) {
                match self {
                    $(CanonicalOp::$variant => ($min, $max),)*
                }
            }

            /// Output count when the graph does not say otherwise
            pub fn default_outputs(&self) -> usize {
                match self {
                    $(CanonicalOp::$variant => $outs,)*
                }
            }

            /// Attribute schema, in emission order
            pub fn attr_specs(&self) -> Vec<$crate::vocab::AttrSpec> {
                match self {
                    $(CanonicalOp::$variant => vec![$(attr_spec!($($spec)*)),*],)*
                }
            }
        }

        impl std::fmt::Display for CanonicalOp {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

//! Declarative macros that derive [crate::codec::Wire] for user-defined payload types.
//!
//! Each macro takes the type definition itself, so adding a message type to a schema is a
//!  matter of declaring it - the codec does not change.

/// Declares a struct whose fields are encoded one after the other in declaration order.
///
/// ```
/// transport::wire_struct! {
///     pub struct ReadRequest {
///         pub path: String,
///         pub offset: i64,
///         pub len: u64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$field_meta:meta])* $field_vis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        $vis struct $name {
            $( $(#[$field_meta])* $field_vis $field : $ty ),*
        }

        impl $crate::codec::Wire for $name {
            #[allow(unused_variables)]
            fn ser(&self, buf: &mut impl $crate::bytes::BufMut) {
                $( $crate::codec::Wire::ser(&self.$field, buf); )*
            }

            #[allow(unused_variables)]
            fn deser(buf: &mut impl $crate::bytes::Buf) -> $crate::codec::DecodeResult<Self> {
                Ok($name {
                    $( $field: <$ty as $crate::codec::Wire>::deser(buf)?, )*
                })
            }
        }
    };
}

/// Declares a field-less enum that is encoded as its ordinal. Decoding rejects ordinals that do
///  not correspond to a variant.
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$variant_meta:meta])* $variant:ident ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$variant_meta])* $variant ),+
        }

        impl $name {
            /// all variants, ordered by ordinal
            pub const VARIANTS: &'static [$name] = &[ $( $name::$variant ),+ ];

            pub fn ordinal(&self) -> u32 {
                *self as u32
            }
        }

        impl $crate::codec::Wire for $name {
            fn ser(&self, buf: &mut impl $crate::bytes::BufMut) {
                $crate::codec::Wire::ser(&self.ordinal(), buf);
            }

            fn deser(buf: &mut impl $crate::bytes::Buf) -> $crate::codec::DecodeResult<Self> {
                let ordinal = <u64 as $crate::codec::Wire>::deser(buf)?;
                usize::try_from(ordinal).ok()
                    .and_then(|idx| Self::VARIANTS.get(idx))
                    .copied()
                    .ok_or($crate::codec::DecodeError::InvalidEnumOrdinal { type_name: stringify!($name), ordinal })
            }
        }
    };
}

/// Declares a tagged union with one payload type per variant. The encoding is the 1-based index
///  of the active variant followed by its payload.
///
/// The payload types must be pairwise distinct: the macro generates `From<payload>` for the union
///  and `TryFrom<union>` for each payload, the latter handing back the union unchanged if a
///  different variant is active.
#[macro_export]
macro_rules! wire_union {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$variant_meta:meta])* $variant:ident ( $ty:ty ) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        $vis enum $name {
            $( $(#[$variant_meta])* $variant($ty) ),+
        }

        impl $name {
            pub fn variant_name(&self) -> &'static str {
                match self {
                    $( $name::$variant(_) => stringify!($variant), )+
                }
            }
        }

        impl $crate::codec::Wire for $name {
            fn ser(&self, buf: &mut impl $crate::bytes::BufMut) {
                let mut index: u64 = 0;
                $(
                    index += 1;
                    if let $name::$variant(inner) = self {
                        $crate::codec::Wire::ser(&index, buf);
                        $crate::codec::Wire::ser(inner, buf);
                        return;
                    }
                )+
            }

            fn deser(buf: &mut impl $crate::bytes::Buf) -> $crate::codec::DecodeResult<Self> {
                let index = <u64 as $crate::codec::Wire>::deser(buf)?;
                let mut candidate: u64 = 0;
                $(
                    candidate += 1;
                    if index == candidate {
                        return Ok($name::$variant(<$ty as $crate::codec::Wire>::deser(buf)?));
                    }
                )+
                Err($crate::codec::DecodeError::InvalidVariantIndex { type_name: stringify!($name), index })
            }
        }

        $(
            impl From<$ty> for $name {
                fn from(value: $ty) -> Self {
                    $name::$variant(value)
                }
            }

            impl TryFrom<$name> for $ty {
                type Error = $name;

                fn try_from(value: $name) -> Result<Self, Self::Error> {
                    match value {
                        $name::$variant(inner) => Ok(inner),
                        #[allow(unreachable_patterns)]
                        other => Err(other),
                    }
                }
            }
        )+
    };
}

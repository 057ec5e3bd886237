//! Macros for reducing status-enum boilerplate.

/// Declare a lifecycle status enum together with its wire names.
///
/// Generates the enum with serde derives, `ALL`, `as_str()`, `is_terminal()`,
/// `Display` and `FromStr`, so the database column, the JSON payload and the
/// log line all use the same snake_case spelling.
///
/// # Example
///
/// ```ignore
/// lifecycle_status! {
///     /// Status of a trip.
///     pub enum TripStatus {
///         Planned => "planned",
///         Active => "active",
///         Completed => "completed",
///     }
///     terminal: [Completed]
/// }
///
/// assert_eq!("active".parse::<TripStatus>()?, TripStatus::Active);
/// ```
macro_rules! lifecycle_status {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
        terminal: [ $($terminal:ident),+ $(,)? ]
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize,
        )]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl $name {
            /// Every status, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire name used in storage and payloads.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire,)+
                }
            }

            /// Terminal statuses accept no further lifecycle edges.
            pub const fn is_terminal(self) -> bool {
                matches!(self, $($name::$terminal)|+)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err($crate::error::ParseStatusError::new(stringify!($name), other)),
                }
            }
        }
    };
}

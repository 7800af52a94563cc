//! Generated identifiers for flows, bricks and runners.
//!
//! Identifiers are a one-letter prefix and a random alphanumeric suffix, e.g.
//! `R-x81Kd0qPzA`. Runner identifiers travel over the wire during registration,
//! which is why they are plain strings rather than integers.

use std::borrow::Borrow;
use std::fmt;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

const SUFFIX_LEN: usize = 10;

fn random_suffix() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix shared by every identifier of this kind.
            pub const PREFIX: &'static str = $prefix;

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, random_suffix()))
            }

            /// Wrap an existing identifier, e.g. one received over the wire.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Identifier of a [`Flow`](crate::flow::Flow).
    FlowId,
    "F"
);
define_id!(
    /// Identifier of a [`Brick`](crate::brick::Brick).
    BrickId,
    "B"
);
define_id!(
    /// Identifier of a [`BrickRunner`](crate::runner::BrickRunner).
    RunnerId,
    "R"
);

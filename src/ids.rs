use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Sentinel form used for default construction before a real id is known.
            pub fn invalid() -> Self {
                Self(String::new())
            }

            pub fn from_value(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn is_valid(&self) -> bool {
                !self.0.is_empty()
            }

            pub fn value(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::invalid()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

define_id!(
    /// Identifies one authenticated SSH session.
    SessionId
);
define_id!(
    /// Identifies one interactive channel within a session.
    ChannelId
);
define_id!(
    /// Identifies one queued file operation.
    OperationId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_valid() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert!(a.is_valid());
        assert!(b.is_valid());
        assert_ne!(a, b);
    }

    #[test]
    fn default_id_is_invalid() {
        assert!(!OperationId::default().is_valid());
        assert_eq!(OperationId::invalid(), OperationId::default());
    }

    #[test]
    fn ids_round_trip_their_value() {
        let id = ChannelId::from_value("abc");
        assert_eq!(id.value(), "abc");
        assert_eq!(id.to_string(), "abc");
    }
}

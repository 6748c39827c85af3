use serde::{Deserialize, Serialize};
use std::fmt;

/// Newtype identifiers so the many `(account, session, user)`-shaped
/// signatures in this crate can't accidentally swap arguments at a call
/// site — the compiler catches it instead of a reviewer.
macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(AccountId);
string_id!(GroupId);
string_id!(UserId);
string_id!(SessionHash);
string_id!(RequestId);

impl RequestId {
    /// 16 hex chars, cryptographically random (§3).
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }
}

/// Opaque classification of a request's model name used to pick a slot
/// range and same-session parallelism rule (§4.3, GLOSSARY). The mapping
/// from concrete model name to category lives in config, not here, since
/// upstream model name patterns evolve independently of this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    Heavy,
    Medium,
    Light,
}

impl fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelCategory::Heavy => write!(f, "heavy"),
            ModelCategory::Medium => write!(f, "medium"),
            ModelCategory::Light => write!(f, "light"),
        }
    }
}

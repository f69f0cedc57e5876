//! # Stage Builder Error Types
//!
//! Every build failure is either a contract violation (a bug in the
//! caller or in a translator, carrying a unique numeric tag) or a
//! user-visible error surfaced through the operation's status channel.
//! There are no retries and no partial results: the first error aborts
//! the whole lowering pass.

use thiserror::Error;

/// Stage builder errors
#[derive(Error, Debug)]
pub enum BuildError {
    /// Internal contract violation. The tag uniquely identifies the
    /// failed invariant in the source.
    #[error("contract violation {tag}: {context}")]
    Contract { tag: u32, context: String },

    /// Namespace missing from the catalog
    #[error("namespace '{0}' not found")]
    NamespaceNotFound(String),

    /// Index missing from the catalog
    #[error("index '{index}' not found on namespace '{namespace}'")]
    IndexNotFound { namespace: String, index: String },

    /// Index entry exists but carries no full-text spec
    #[error("index '{index}' on namespace '{namespace}' is not a text index")]
    NotATextIndex { namespace: String, index: String },

    /// Operation was killed while the builder was consulting the catalog
    #[error("operation interrupted during plan construction")]
    Interrupted,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

/// Runtime error codes embedded into `fail()` expressions. These surface
/// at execution time, not at build time.
pub mod codes {
    /// Generic bad-value error (parallel arrays during sort)
    pub const BAD_VALUE: u32 = 2;
    /// Text-match subject was not a document
    pub const TEXT_SUBJECT_NOT_OBJECT: u32 = 621_450;
}

/// Return a [`BuildError::Contract`] from the enclosing function unless
/// the condition holds.
#[macro_export]
macro_rules! check_contract {
    ($cond:expr, $tag:expr, $($msg:tt)+) => {
        if !$cond {
            return Err($crate::error::BuildError::Contract {
                tag: $tag,
                context: format!($($msg)+),
            });
        }
    };
}

/// Build a [`BuildError::Contract`] value (for `ok_or_else` / explicit
/// returns).
#[macro_export]
macro_rules! contract_error {
    ($tag:expr, $($msg:tt)+) => {
        $crate::error::BuildError::Contract {
            tag: $tag,
            context: format!($($msg)+),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(flag: bool) -> Result<(), BuildError> {
        check_contract!(flag, 75_001, "flag must be set");
        Ok(())
    }

    #[test]
    fn test_check_contract_passes_and_fails() {
        assert!(failing(true).is_ok());

        let err = failing(false).expect_err("must fail");
        let BuildError::Contract { tag, context } = err else {
            panic!("expected contract violation");
        };
        assert_eq!(tag, 75_001);
        assert!(context.contains("flag"));
    }
}

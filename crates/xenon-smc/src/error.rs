use std::io;

use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, SmcError>;

/// Failures that prevent an SMC from being brought up.
///
/// Register accesses never fail; these only come out of construction.
#[derive(Debug, Error)]
pub enum SmcError {
    #[error("failed to spawn SMC thread `{name}`")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A byte that is not a member of one of the wire enumerations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown {kind} code {code:#04x}")]
pub struct UnknownCode {
    pub kind: &'static str,
    pub code: u8,
}

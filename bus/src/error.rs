//! Error types for configuration, startup, and runtime calls.

use thiserror::Error;

/// Errors raised while configuring a bus before start.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Category names are limited to 50 characters and may not contain `.`
    #[error("invalid category name `{0}`")]
    InvalidCategoryName(String),

    /// The category was already registered
    #[error("category `{0}` already exists")]
    DuplicateCategory(String),

    /// The named category does not exist
    #[error("unknown category `{0}`")]
    UnknownCategory(String),

    /// Command names are limited to 200 characters
    #[error("invalid command name `{0}`")]
    InvalidCommandName(String),

    /// The command was already registered in this category
    #[error("command `{0}.{1}` already registered")]
    DuplicateCommand(String, String),

    /// The alias source was already mapped
    #[error("alias `{0}` already registered")]
    DuplicateAlias(String),

    /// The supplied public key does not match the secret key
    #[error("public key does not match secret key")]
    KeyMismatch,

    /// Service-node instances must be given their long-term keypair
    #[error("service node instances require an explicit keypair")]
    MissingKeypair,
}

/// Fatal errors raised by `start()`.
#[derive(Error, Debug)]
pub enum StartError {
    /// Invalid configuration detected at start
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A listen address could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that failed to bind
        addr: std::net::SocketAddr,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// The proxy runtime could not be created
    #[error("failed to build proxy runtime: {0}")]
    Runtime(std::io::Error),

    /// The proxy thread could not be spawned
    #[error("failed to spawn proxy thread: {0}")]
    Spawn(std::io::Error),
}

/// The bus is shutting down (or has shut down); the call was dropped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("bus is shutting down")]
pub struct Stopped;

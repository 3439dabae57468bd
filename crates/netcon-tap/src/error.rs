use std::io;

use netcon_stack::StackError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to spawn {0} thread")]
    Spawn(&'static str, #[source] io::Error),
    #[error("invalid tap configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Stack(#[from] StackError),
}

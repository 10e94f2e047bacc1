//! Log pipeline errors.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("log database failure")]
    Sqlite(#[from] rusqlite::Error),

    #[error("log file i/o failure")]
    Io(#[from] std::io::Error),

    #[error("log store is closed")]
    Closed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

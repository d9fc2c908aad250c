use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot open dump file {path}: {source}")]
    DumpOpen { path: String, source: std::io::Error },

    #[error("cannot write dump file {path}: {source}")]
    DumpWrite { path: String, source: std::io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

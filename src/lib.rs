use std::result;

pub mod descriptors;
pub mod error;
pub mod file;
pub mod leb128;
pub mod linker;
pub mod utf;

pub type Result<T> = result::Result<T, error::DexError>;

pub type LinkResult<T> = result::Result<T, error::LinkError>;

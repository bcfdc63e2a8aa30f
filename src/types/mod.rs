pub mod error;

pub use error::{GabError, Result};

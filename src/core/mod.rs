pub mod error;

pub use error::{ClientError, ErrorResponse, Result};

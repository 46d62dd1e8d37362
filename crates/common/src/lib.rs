//! Types shared by the ERPNext CLI crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;

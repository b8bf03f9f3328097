pub mod access;
pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use access::{TissContext, TissRole};
pub use error::TissError;
pub use models::*;
pub use router::tiss_routes;

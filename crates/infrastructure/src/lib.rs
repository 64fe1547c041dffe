pub mod database;
pub mod fast_store;
pub mod observability;

pub use database::*;
pub use fast_store::*;
pub use observability::*;

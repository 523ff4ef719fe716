pub mod database;
pub mod error;
pub mod schema;
pub mod threads;
pub mod turns;

pub use database::Database;
pub use error::StoreError;
pub use threads::ThreadRepo;
pub use turns::TurnRepo;

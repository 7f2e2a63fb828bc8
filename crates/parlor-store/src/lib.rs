pub mod database;
pub mod decode;
pub mod error;
pub mod messages;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
pub use messages::MessageRepo;
pub use sessions::SessionRepo;

pub mod inmem;
pub mod postgres;
pub mod users;

pub use inmem::InMemory;
pub use postgres::PostgresStore;
pub use users::{
    parse_id, DynUserStorer, StoreConnection, StoredUser, UserStoreError, UserStorer,
};

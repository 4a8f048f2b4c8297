mod models;
mod postgres;
mod users;


pub use postgres::{PostgresError, PostgresStore};

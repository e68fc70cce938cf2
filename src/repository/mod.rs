pub mod default;
pub mod interface;
pub mod postgres;
pub mod sqlite;

pub mod docker;
pub mod sqlite;

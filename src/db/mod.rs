pub mod connection;
pub mod migrations;

pub use connection::open_connection;
pub use migrations::{run_migrations, schema_version};

pub mod connection;
pub mod registry;
pub mod watcher;

pub use connection::Gateway;
pub use registry::ConnectionRegistry;

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod external;
pub mod namespace;
pub mod path_guard;
pub mod plugin;
pub mod registry;
pub mod resolver;

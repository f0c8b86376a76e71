//! Connection configuration for the orm handle.
//!
//! A caller fills in an [`OrmConfig`] (by hand, from `DB_*` variables or from
//! a YAML file), [`OrmConfig::resolve`] turns it into a [`ResolvedConfig`]
//! with every default applied, and [`ConnectionDescriptor`] turns that into
//! the address of the production database.

pub mod dsn;
pub mod env;
pub mod loader;
pub mod types;

pub use dsn::*;
pub use env::*;
pub use loader::*;
pub use types::*;

pub mod access;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod layout;
pub mod notify;
pub mod requests;
pub mod service;
pub mod store;
pub mod vocab;

pub use config::Config;
pub use error::{ErrorKind, KingraphError, Result};
pub use identity::ProfileRef;
pub use service::FamilyGraph;
pub use vocab::{RelationshipKind, Role};

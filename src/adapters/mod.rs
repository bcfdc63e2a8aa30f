//! Storage adapters implementing the collaborator traits in `store`
pub mod sqlite;

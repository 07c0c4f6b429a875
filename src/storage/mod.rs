mod schema;
mod seen;
mod sources;
mod store;
mod types;

pub use schema::Database;
pub use store::StateStore;
pub use types::{DatabaseError, ScheduleState, StateStoreError, StoredSource};

pub mod assistant;
pub mod query;
pub mod room;

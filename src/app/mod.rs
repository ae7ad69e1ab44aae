pub mod hint_store;
pub mod model;
pub mod queue;
pub mod registry;
pub mod resume;

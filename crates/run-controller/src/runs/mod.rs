//! Run creation and run queries.

pub mod buffers;
pub mod codespec;
pub mod creator;
pub mod manager;
pub mod objects;
pub mod reader;
pub mod resources;

pub use creator::RunCreator;
pub use manager::RunManager;
pub use objects::RunObjects;

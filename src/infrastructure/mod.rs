pub mod kis;
pub mod mock;
pub mod persistence;

pub mod collection;
pub mod media;

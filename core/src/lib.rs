pub mod error;
pub mod page;
pub mod profile;
pub mod result;

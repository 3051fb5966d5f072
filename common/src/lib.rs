pub mod chat;
pub mod dates;
pub mod error;

pub mod backend;
pub mod card;
pub mod protocol;

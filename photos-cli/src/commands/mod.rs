pub mod admin;
pub mod photo;
pub mod serve;

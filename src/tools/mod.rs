pub mod ask;
pub mod backends;

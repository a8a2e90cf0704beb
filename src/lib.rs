pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod orchestrator;
pub mod request;
pub mod response;
pub mod server;
pub mod stream;
pub mod tools;

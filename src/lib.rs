pub mod command;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod frame;
pub mod link;
pub mod mission;
pub mod transport;
pub mod vehicle;

pub mod config;
pub mod console;
pub mod handler;
pub mod manager;
pub mod observer;
pub mod session;

#![forbid(unsafe_code)]

pub mod command_reader;
pub mod health;
pub mod listener;
pub mod poller;
pub mod session;

#[cfg(test)]
mod test_support;

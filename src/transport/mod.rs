//! Transports for sending a built message.

pub mod smtp;

//! Connection intake
//!
//! Every stream a client dials begins with one message saying what the
//! stream is for: a control login, a work connection, or a visitor.

mod handler;
mod listener;

pub use handler::CONN_READ_TIMEOUT;

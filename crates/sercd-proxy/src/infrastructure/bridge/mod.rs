//! Bridge engine implementations.
//!
//! - [`raw_tcp::RawTcpEngine`] forwards bytes transparently between the
//!   serial device and one TCP client at a time.
//! - [`mock::ScriptedEngine`] replays a fixed list of progress events and
//!   then behaves as scripted; used by supervisor tests.

pub mod mock;
pub mod raw_tcp;

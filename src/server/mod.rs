pub mod builder;
pub mod connection;
pub mod dispatcher;
pub mod listener;
pub mod reader;

pub use builder::{Server, ServerBuilder, ShutdownReport};
pub use connection::Connection;
pub use dispatcher::start_accepting;
pub use listener::{bind_tcp, AcceptError, ListeningSocket};
pub use reader::{ChunkSink, ConnectionReader, LogSink, ReadOutcome};

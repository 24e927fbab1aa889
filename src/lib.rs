mod error;
mod interrupt;
pub mod measure;
mod server;
mod ticker;
mod window_counter;

pub use crate::error::CounterError;
pub use crate::interrupt::Interrupt;
pub use crate::server::{LineServer, ServeReport, ServerOptions, exclaim, handle_lines};
pub use crate::window_counter::{CounterOptions, WindowedCounter, segment_index, unix_nanos};

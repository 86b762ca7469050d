//! Chat-layer glue: command grammar, callback matching and the manual
//! trade path. Rendering and delivery live outside the core; only typed
//! intents cross this boundary.

pub mod callbacks;
pub mod commands;
pub mod manual;

pub use callbacks::{parse_callback, CallbackEvent, CallbackIntent};
pub use commands::{parse_command, Command, CommandError};
pub use manual::{ManualTradeAck, ManualTradeService};

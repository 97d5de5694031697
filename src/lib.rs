//! Playback of live Shoutcast/Icecast streams: ICY metadata demuxing,
//! MPEG audio and ADTS framing, decoding and scheduled output.

pub mod audio;
pub mod config;
pub mod decoder;
pub mod eq;
pub mod fanout;
pub mod fetch;
pub mod frame;
pub mod graph;
pub mod icy;
pub mod logger;
pub mod output;
pub mod parser;
pub mod player;
pub mod resample;
pub mod scheduler;
pub mod session;

pub use crate::config::Config;
pub use crate::player::{PlaybackState, Player, PlayerError, PlayerEvent, PlayerItem};

//! voxline — client-side session manager for live transcription over a
//! persistent websocket.
//!
//! ARCHITECTURE
//! ============
//! One [`LiveClient`] owns one upstream connection, one exit latch, and one
//! dispatch table. `start` establishes the session and spawns two concurrent
//! tasks sharing the socket handle: the receive loop (pulls inbound frames,
//! classifies them by their `type` discriminator, dispatches typed events to
//! subscribers in wire order) and the optional keepalive loop (sends a
//! periodic liveness frame). Every fatal condition funnels through a single
//! shutdown sequence, so teardown happens exactly once no matter which task
//! detects the failure first.
//!
//! Wire types live in the sibling `frames` crate and are re-exported here.
//!
//! ```no_run
//! use voxline::{ClientConfig, EventKind, LiveClient, LiveEvent, StartParams};
//!
//! # async fn run() -> Result<(), voxline::LiveError> {
//! let config = ClientConfig::new("https://api.example.com", "secret-key")
//!     .with_option("keepalive", "true");
//! let mut client = LiveClient::new(config)?;
//!
//! client.on(EventKind::Transcript, |event, _context| {
//!     if let LiveEvent::Transcript(transcript) = event {
//!         if let Some(text) = transcript.transcript() {
//!             println!("{text}");
//!         }
//!     }
//! });
//!
//! if client.start(StartParams::new()).await? {
//!     client.send(b"audio bytes".as_slice()).await?;
//!     client.finalize().await?;
//!     client.finish().await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod live;

pub use config::{
    ClientConfig, LiveOptions, OPT_KEEPALIVE, OPT_RAISE_ON_CONNECT, OPT_RAISE_ON_ERROR,
    OPT_RAISE_ON_SEND, OptionsInput, StartParams,
};
pub use dispatch::{Context, Dispatcher, Handler};
pub use error::LiveError;
pub use live::{LiveClient, Payload};

pub use frames::{
    CloseEvent, ControlFrame, DecodeError, ErrorEvent, EventKind, LiveEvent, MetadataEvent,
    OpenEvent, SpeechStartedEvent, TranscriptEvent, UnhandledEvent, UtteranceEndEvent,
    decode_event,
};

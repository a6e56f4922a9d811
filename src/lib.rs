pub mod api;
pub mod config;
pub mod error;
pub mod media;
pub mod mesh;
pub mod recording;

pub use config::Config;
pub use error::{MeetError, Result};
pub use mesh::{ClientCommand, MeetingClient, Notice, TeardownReason};

pub mod capture;
pub mod config;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod socket;
pub mod store;
pub mod transport;
pub mod types;

// Scripted collaborators shared by the integration tests.
pub mod test_utils;

pub use config::Config;
pub use session::VoiceSession;

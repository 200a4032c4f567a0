pub mod player;
pub mod recorder;
pub mod session;

pub use player::Player;
pub use recorder::Recorder;
pub use session::{Collaborators, Devices, SessionConfig, SessionController, SessionHandle};

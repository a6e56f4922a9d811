pub mod join_check;
pub mod launcher;
pub mod signaling_socket;

pub use join_check::{check_can_join, JoinPermit};
pub use launcher::run_meeting;
pub use signaling_socket::{connect, SignalingConnection};

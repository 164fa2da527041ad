//! Control-mode subprocess supervision.

mod supervisor;

pub use supervisor::{
    check_tmux, ensure_session, ControlModeSupervisor, LineCallback, RestartCallback, SendError,
    SupervisorConfig,
};

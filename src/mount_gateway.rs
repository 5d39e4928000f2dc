// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::time::Duration;

use crate::command_class::Reply;
use crate::command_runner::CommandRunner;
use crate::mount_state::{MountState, SharedMountState};

/// What the model builder and the environment feed need from the mount:
/// send a command and get its framed reply, and read the polled state.
pub trait MountGateway: Send + Sync {
    /// None when the command failed or timed out. Commands without a reply
    /// yield an empty Reply.
    fn command(&self, command: &str) -> Option<Reply>;

    fn snapshot(&self) -> MountState;
}

/// MountGateway over the command runner and the pollers' shared state.
pub struct LiveMount {
    runner: Arc<CommandRunner>,
    state: SharedMountState,
    reply_timeout: Duration,
}

impl LiveMount {
    pub fn new(runner: Arc<CommandRunner>, state: SharedMountState,
               reply_timeout: Duration) -> Self {
        LiveMount { runner, state, reply_timeout }
    }
}

impl MountGateway for LiveMount {
    fn command(&self, command: &str) -> Option<Reply> {
        self.runner.send(command, self.reply_timeout)
    }

    fn snapshot(&self) -> MountState {
        self.state.snapshot()
    }
}

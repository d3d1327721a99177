//! System configuration

use crate::sandbox::DEFAULT_LOG_BUFFER_SIZE;
use plugos_api::Environment;

/// Configuration for a [`System`](crate::System)
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Environment of this host; `None` runs functions of every environment
    pub env: Option<Environment>,

    /// Console lines kept per plug
    pub log_buffer_size: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            env: None,
            log_buffer_size: DEFAULT_LOG_BUFFER_SIZE,
        }
    }
}

impl SystemConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the host to an environment
    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_log_buffer_size(mut self, size: usize) -> Self {
        self.log_buffer_size = size;
        self
    }
}

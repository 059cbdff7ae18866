use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use ripple::FailurePolicy;

/// Demo configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub failure_policy: FailurePolicy,
    pub slow_receiver_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            failure_policy: env::var("RIPPLE_FAILURE_POLICY")
                .unwrap_or_else(|_| "propagate".to_string())
                .parse()
                .map_err(|e: String| anyhow!(e))
                .context("RIPPLE_FAILURE_POLICY must be 'propagate' or 'isolate'")?,
            slow_receiver_delay: Duration::from_millis(
                env::var("RIPPLE_SLOW_RECEIVER_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()
                    .context("RIPPLE_SLOW_RECEIVER_MS must be a valid number")?,
            ),
        })
    }
}

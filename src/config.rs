use serde::{Deserialize, Serialize};

/// Well-known port the space listens on for node registrations and client
/// submissions.
pub const DEFAULT_PORT: u16 = 8001;

/// Workers per node default to this multiple of the CPU count; decompositions
/// fan out faster than cores fill, so oversubscribing keeps dispatch latency
/// hidden behind execution.
const WORKER_FACTOR: usize = 2;

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Interface to bind the listener to.
    pub bind: String,
    pub port: u16,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl SpaceConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bind.is_empty() {
            return Err("bind address must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Compute-node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host name or address of the space.
    pub space_host: String,
    pub space_port: u16,
    /// Parallel fetch-execute-report slots this node offers.
    pub workers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            space_host: "localhost".to_string(),
            space_port: DEFAULT_PORT,
            workers: WORKER_FACTOR * num_cpus::get(),
        }
    }
}

impl NodeConfig {
    pub fn space_addr(&self) -> String {
        format!("{}:{}", self.space_host, self.space_port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.space_host.is_empty() {
            return Err("space host must not be empty".to_string());
        }
        if self.workers == 0 {
            return Err("node must offer at least one worker".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(SpaceConfig::default().validate().is_ok());
        assert!(NodeConfig::default().validate().is_ok());
        assert!(NodeConfig::default().workers >= 2);
    }

    #[test]
    fn zero_workers_rejected() {
        let config = NodeConfig {
            workers: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

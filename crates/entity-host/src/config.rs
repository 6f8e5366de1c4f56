use crate::error::EntityError;

/// Configuration for an entity host process.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Number of request processor lanes. Each non-universal concurrency key is pinned to
    /// one lane; universal-key work is spread across all of them. Default: 8.
    pub processor_lanes: usize,
    /// Whether the host starts in the ACTIVE role. Managed entities created while the host
    /// is active start with role Active. Default: false (start as a passive replica).
    pub start_active: bool,
}

impl HostConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - `processor_lanes >= 1` (lane selection divides by it)
    pub fn validate(&self) -> Result<(), EntityError> {
        if self.processor_lanes == 0 {
            return Err(EntityError::InvalidConfig {
                reason: "processor_lanes must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            processor_lanes: 8,
            start_active: false,
        }
    }
}

//! Engine configuration

use crate::error::{Error, Result};

/// Configuration for the aggregation engine.
#[derive(Debug, Clone)]
pub struct AggConfig {
    /// Stripes processed before the driver yields to the scheduler
    pub credits_max: u32,

    /// Alignment of the working cell buffers in bytes
    pub buffer_align: usize,
}

impl AggConfig {
    pub fn validate(&self) -> Result<()> {
        if self.credits_max == 0 {
            return Err(Error::InvalidInput("credits_max must be > 0".into()));
        }
        if !self.buffer_align.is_power_of_two() {
            return Err(Error::InvalidInput(
                "buffer_align must be a power of two".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AggConfig {
    fn default() -> Self {
        Self {
            credits_max: 1024,
            buffer_align: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = AggConfig::default();
        assert_eq!(config.credits_max, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AggConfig::default();
        config.credits_max = 0;
        assert!(config.validate().is_err());

        let mut config = AggConfig::default();
        config.buffer_align = 24;
        assert!(config.validate().is_err());
    }
}

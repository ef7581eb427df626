//! Process-wide tunables consulted when sizing pool messages.
//!
//! There is exactly one knob in this core: `max_fragment_size`. It is read
//! only after a [`CoreLimits`] has been built, using a validate-then-construct
//! builder style.

use crate::error::{CoreError, ErrorKind};

/// Default `max_fragment_size`: 16 KiB, a typical TLS-record-friendly cap.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 16 * 1024;

/// Process-wide limits consulted by [`Channel::acquire_message_from_pool`].
///
/// [`Channel::acquire_message_from_pool`]: crate::channel::Channel::acquire_message_from_pool
#[derive(Clone, Copy, Debug)]
pub struct CoreLimits {
    max_fragment_size: usize,
}

impl Default for CoreLimits {
    fn default() -> Self {
        Self {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
        }
    }
}

impl CoreLimits {
    pub fn builder() -> CoreLimitsBuilder {
        CoreLimitsBuilder::default()
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CoreLimitsBuilder {
    max_fragment_size: Option<usize>,
}

impl CoreLimitsBuilder {
    pub fn max_fragment_size(mut self, value: usize) -> Self {
        self.max_fragment_size = Some(value);
        self
    }

    /// Validate and construct. The only current contradiction is a
    /// zero-sized fragment budget, which would make every pool acquisition
    /// fail; reject it at build time rather than letting it surface later as
    /// a confusing per-message capacity error.
    pub fn build(self) -> Result<CoreLimits, CoreError> {
        let max_fragment_size = self.max_fragment_size.unwrap_or(DEFAULT_MAX_FRAGMENT_SIZE);
        if max_fragment_size == 0 {
            return Err(CoreError::new(
                ErrorKind::Setup,
                "setup.invalid_limits",
                "max_fragment_size must be greater than zero",
            ));
        }
        Ok(CoreLimits { max_fragment_size })
    }
}

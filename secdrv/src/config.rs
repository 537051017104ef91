use crate::arena::MAX_CONTEXTS;
use crate::sg::SgContext;

/// How a context pool may be shared between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadMode {
    /// One thread owns the pool; completions are still reported from any
    /// thread through a [`PacketCounter`](crate::PacketCounter).
    #[default]
    Exclusive,
    /// Several producer threads share the pool behind one lock.
    Shared,
}

/// Sizing and threading configuration for the resource pools.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of crypto contexts in the context pool.
    pub contexts: usize,
    /// Number of SG contexts. Each one owns an input and an output table of
    /// [`MAX_SG_ENTRIES`](crate::MAX_SG_ENTRIES) entries carved from DMA memory.
    pub sg_contexts: usize,
    /// Thread mode of the context pool.
    pub thread_mode: ThreadMode,
    /// Capacity of the arena built by
    /// [`ContextArena::from_config`](crate::ContextArena::from_config). The
    /// global arena always holds [`MAX_CONTEXTS`].
    pub arena_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            contexts: 256,
            sg_contexts: 64,
            thread_mode: ThreadMode::Exclusive,
            arena_capacity: MAX_CONTEXTS,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.contexts == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "contexts must be > 0".into(),
            ));
        }
        if self.arena_capacity == 0 || self.arena_capacity >= u32::MAX as usize {
            return Err(crate::error::Error::InvalidConfig(
                "arena_capacity must be > 0 and < 2^32 - 1".into(),
            ));
        }
        if self.contexts > self.arena_capacity {
            return Err(crate::error::Error::InvalidConfig(format!(
                "contexts ({}) exceeds arena_capacity ({})",
                self.contexts, self.arena_capacity
            )));
        }
        if self.sg_contexts == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "sg_contexts must be > 0".into(),
            ));
        }
        if self.sg_contexts >= u32::MAX as usize {
            return Err(crate::error::Error::InvalidConfig(
                "sg_contexts must be < 2^32 - 1".into(),
            ));
        }
        Ok(())
    }

    /// DMA bytes an SG pool of `sg_contexts` carves from its cursor,
    /// not counting alignment padding before the first table.
    pub fn dma_bytes(&self) -> usize {
        self.sg_contexts * SgContext::DMA_BYTES
    }
}

/// Builder for [`Config`] with `build()` validation.
///
/// # Example
///
/// ```rust
/// use secdrv::{ConfigBuilder, ThreadMode};
///
/// let config = ConfigBuilder::new()
///     .contexts(512)
///     .sg_contexts(128)
///     .thread_mode(ThreadMode::Shared)
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.contexts, 512);
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of crypto contexts.
    pub fn contexts(mut self, n: usize) -> Self {
        self.config.contexts = n;
        self
    }

    /// Set the number of SG contexts.
    pub fn sg_contexts(mut self, n: usize) -> Self {
        self.config.sg_contexts = n;
        self
    }

    /// Choose exclusive or shared ownership of the context pool.
    pub fn thread_mode(mut self, mode: ThreadMode) -> Self {
        self.config.thread_mode = mode;
        self
    }

    /// Set the capacity of an arena built from this config.
    pub fn arena_capacity(mut self, n: usize) -> Self {
        self.config.arena_capacity = n;
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sg::MAX_SG_ENTRIES;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn builder_sets_fields() {
        let config = ConfigBuilder::new()
            .contexts(10)
            .sg_contexts(4)
            .thread_mode(ThreadMode::Shared)
            .arena_capacity(16)
            .build()
            .unwrap();
        assert_eq!(config.contexts, 10);
        assert_eq!(config.sg_contexts, 4);
        assert_eq!(config.thread_mode, ThreadMode::Shared);
        assert_eq!(config.arena_capacity, 16);
        assert_eq!(config.dma_bytes(), 4 * 2 * MAX_SG_ENTRIES * 16);
    }

    #[test]
    fn rejects_out_of_range() {
        let cases = [
            ConfigBuilder::new().contexts(0),
            ConfigBuilder::new().sg_contexts(0),
            ConfigBuilder::new().contexts(20).arena_capacity(10),
            ConfigBuilder::new().arena_capacity(0),
        ];
        for builder in cases {
            assert!(matches!(builder.build(), Err(Error::InvalidConfig(_))));
        }
    }
}

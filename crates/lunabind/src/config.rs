//! VM construction options.

/// Options applied when a [`Vm`](crate::Vm) is created.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Preload the standard library (`string`, `table`, `math`, ...)
    pub open_libs: bool,

    /// Extra stack slots reserved before each bridge operation
    pub stack_headroom: i32,

    /// Chunk name given to source loaded from strings
    pub chunk_name: String,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            open_libs: true,
            stack_headroom: 32,
            chunk_name: "=lunabind".to_string(),
        }
    }
}

impl VmOptions {
    /// Options for a bare VM without the standard library
    pub fn bare() -> Self {
        Self {
            open_libs: false,
            ..Self::default()
        }
    }

    /// Set whether the standard library is preloaded
    pub fn with_libs(mut self, open_libs: bool) -> Self {
        self.open_libs = open_libs;
        self
    }

    /// Set the stack headroom reserved before bridge operations
    pub fn with_stack_headroom(mut self, slots: i32) -> Self {
        self.stack_headroom = slots.max(1);
        self
    }

    /// Set the chunk name used for string sources
    pub fn with_chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = VmOptions::default();
        assert!(options.open_libs);
        assert_eq!(options.stack_headroom, 32);
        assert_eq!(options.chunk_name, "=lunabind");
    }

    #[test]
    fn test_builders() {
        let options = VmOptions::bare()
            .with_stack_headroom(0)
            .with_chunk_name("=script");
        assert!(!options.open_libs);
        assert_eq!(options.stack_headroom, 1);
        assert_eq!(options.chunk_name, "=script");
        assert!(options.with_libs(true).open_libs);
    }
}

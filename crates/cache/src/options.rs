//! Operator configuration.
//!
//! Every option struct has a `Default` impl and consuming builder setters.

/// Item count above which a resort is reported as a reset.
pub const DEFAULT_RESET_THRESHOLD: usize = 100;

/// Batch size above which a bound list is rebuilt instead of patched.
pub const DEFAULT_BINDING_RESET_THRESHOLD: usize = 25;

/// Options for connecting to a cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Skip batches that carry no changes.
    pub suppress_empty_changesets: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            suppress_empty_changesets: true,
        }
    }
}

impl ConnectOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether empty batches are skipped.
    pub fn suppress_empty_changesets(mut self, suppress: bool) -> Self {
        self.suppress_empty_changesets = suppress;
        self
    }
}

/// Options for the filter operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterOptions {
    /// Skip batches that filter down to nothing.
    pub suppress_empty_changesets: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            suppress_empty_changesets: true,
        }
    }
}

impl FilterOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether empty batches are skipped.
    pub fn suppress_empty_changesets(mut self, suppress: bool) -> Self {
        self.suppress_empty_changesets = suppress;
        self
    }
}

/// Options for the sort operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortOptions {
    /// Above this many items a comparer change or resort emits a reset
    /// instead of individual moves.
    pub reset_threshold: usize,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            reset_threshold: DEFAULT_RESET_THRESHOLD,
        }
    }
}

impl SortOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reset threshold.
    pub fn reset_threshold(mut self, threshold: usize) -> Self {
        self.reset_threshold = threshold;
        self
    }
}

/// Options for the transform operators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransformOptions {
    /// Recompute the transformed value when the source item is refreshed.
    pub transform_on_refresh: bool,
}

impl TransformOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether a refresh recomputes the transformed value.
    pub fn transform_on_refresh(mut self, enabled: bool) -> Self {
        self.transform_on_refresh = enabled;
        self
    }
}

/// Options for the list binding adaptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingOptions {
    /// Batches with more changes than this rebuild the list.
    pub reset_threshold: usize,
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            reset_threshold: DEFAULT_BINDING_RESET_THRESHOLD,
        }
    }
}

impl BindingOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reset threshold.
    pub fn reset_threshold(mut self, threshold: usize) -> Self {
        self.reset_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_defaults() {
        assert!(ConnectOptions::default().suppress_empty_changesets);
        assert!(FilterOptions::default().suppress_empty_changesets);
        assert_eq!(SortOptions::default().reset_threshold, DEFAULT_RESET_THRESHOLD);
        assert!(!TransformOptions::default().transform_on_refresh);
        assert_eq!(BindingOptions::default().reset_threshold, DEFAULT_BINDING_RESET_THRESHOLD);
    }

    #[test]
    fn test_option_builders() {
        let options = SortOptions::new().reset_threshold(5);
        assert_eq!(options.reset_threshold, 5);
        assert!(TransformOptions::new().transform_on_refresh(true).transform_on_refresh);
        assert!(!ConnectOptions::new().suppress_empty_changesets(false).suppress_empty_changesets);
    }
}

//! Call-depth bookkeeping for nested dispatch.

/// Emitted when the outermost call of a nested chain completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwind;

/// Tracks calls made while already servicing a call.
///
/// A chain is *nested* once a call starts, or a prompt is issued, while the
/// depth is above zero. When a nested chain returns to depth zero the
/// console prompt must be reset, which [`exit`](Self::exit) reports as an
/// [`Unwind`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallDepth {
    depth: u32,
    nested: bool,
}

impl CallDepth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_nested(&self) -> bool {
        self.nested
    }

    pub fn enter(&mut self) {
        if self.depth > 0 {
            self.nested = true;
        }
        self.depth += 1;
    }

    /// Record a console prompt issued at the current depth.
    pub fn prompt(&mut self) {
        if self.depth > 0 {
            self.nested = true;
        }
    }

    pub fn exit(&mut self) -> Option<Unwind> {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 && self.nested {
            self.nested = false;
            Some(Unwind)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_call_does_not_unwind() {
        let mut depth = CallDepth::new();
        depth.enter();
        assert_eq!(depth.exit(), None);
        assert_eq!(depth.depth(), 0);
    }

    #[test]
    fn test_nested_chain_unwinds_once_at_zero() {
        let mut depth = CallDepth::new();
        let mut unwinds = Vec::new();

        depth.enter();
        depth.enter();
        assert_eq!(depth.depth(), 2);
        unwinds.push(depth.exit());
        assert_eq!(depth.depth(), 1);
        unwinds.push(depth.exit());

        assert_eq!(unwinds, vec![None, Some(Unwind)]);
        assert!(!depth.is_nested());
    }

    #[test]
    fn test_prompt_inside_call_marks_nested() {
        let mut depth = CallDepth::new();
        depth.prompt();
        assert!(!depth.is_nested());

        depth.enter();
        depth.prompt();
        assert!(depth.is_nested());
        assert_eq!(depth.exit(), Some(Unwind));
    }

    #[test]
    fn test_exit_at_rest_saturates() {
        let mut depth = CallDepth::new();
        assert_eq!(depth.exit(), None);
        assert_eq!(depth.depth(), 0);
    }
}

//! Emitter and optimizer configuration
//!
//! Plain structs with `Default` and chainable setters:
//!
//! ```ignore
//! let config = EmitterConfig::default()
//!     .label_policy(LabelPolicy::Lenient)
//!     .reinit_reused_locals(false);
//! ```

/// How a label reached by fallthrough before any branch is constrained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelPolicy {
    /// The label requires an empty stack; a non-empty fallthrough stack is
    /// rejected and every later branch must arrive empty
    #[default]
    Strict,

    /// The label adopts whatever shape fallthrough brings to it
    Lenient,
}

/// Call kinds that must never receive the `tail.` prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Direct,
    Virtual,
    Indirect,
    VarArgs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailCallPolicy {
    pub denied: Vec<CallKind>,
}

impl TailCallPolicy {
    pub fn allows(&self, kind: CallKind) -> bool {
        !self.denied.contains(&kind)
    }

    pub fn deny(mut self, kind: CallKind) -> Self {
        if !self.denied.contains(&kind) {
            self.denied.push(kind);
        }
        self
    }

    pub fn allow(mut self, kind: CallKind) -> Self {
        self.denied.retain(|denied| *denied != kind);
        self
    }
}

impl Default for TailCallPolicy {
    fn default() -> Self {
        Self {
            denied: vec![CallKind::Indirect, CallKind::VarArgs],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizerConfig {
    pub shorten_branches: bool,
    pub elide_casts: bool,
    pub mark_tail_calls: bool,
    pub tail_calls: TailCallPolicy,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            shorten_branches: true,
            elide_casts: true,
            mark_tail_calls: true,
            tail_calls: TailCallPolicy::default(),
        }
    }
}

impl OptimizerConfig {
    /// Configuration with every pass switched off
    pub fn disabled() -> Self {
        Self {
            shorten_branches: false,
            elide_casts: false,
            mark_tail_calls: false,
            tail_calls: TailCallPolicy::default(),
        }
    }

    pub fn shorten_branches(mut self, enabled: bool) -> Self {
        self.shorten_branches = enabled;
        self
    }

    pub fn elide_casts(mut self, enabled: bool) -> Self {
        self.elide_casts = enabled;
        self
    }

    pub fn mark_tail_calls(mut self, enabled: bool) -> Self {
        self.mark_tail_calls = enabled;
        self
    }

    pub fn tail_calls(mut self, policy: TailCallPolicy) -> Self {
        self.tail_calls = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterConfig {
    pub label_policy: LabelPolicy,

    /// Store a default value into a reused local slot when it is handed out
    pub reinit_reused_locals: bool,

    /// Upper bound on the bad paths reconstructed for a merge failure
    pub max_bad_paths: usize,

    pub optimizer: OptimizerConfig,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            label_policy: LabelPolicy::Strict,
            reinit_reused_locals: true,
            max_bad_paths: 8,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl EmitterConfig {
    pub fn label_policy(mut self, policy: LabelPolicy) -> Self {
        self.label_policy = policy;
        self
    }

    pub fn reinit_reused_locals(mut self, reinit: bool) -> Self {
        self.reinit_reused_locals = reinit;
        self
    }

    pub fn max_bad_paths(mut self, max: usize) -> Self {
        self.max_bad_paths = max;
        self
    }

    pub fn optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EmitterConfig::default();

        assert_eq!(config.label_policy, LabelPolicy::Strict);
        assert!(config.reinit_reused_locals);
        assert_eq!(config.max_bad_paths, 8);
        assert!(config.optimizer.shorten_branches);
        assert!(config.optimizer.elide_casts);
        assert!(config.optimizer.mark_tail_calls);
    }

    #[test]
    fn test_tail_call_policy() {
        let policy = TailCallPolicy::default();
        assert!(!policy.allows(CallKind::Indirect));
        assert!(!policy.allows(CallKind::VarArgs));
        assert!(policy.allows(CallKind::Virtual));

        let policy = policy.allow(CallKind::Indirect).deny(CallKind::Virtual);
        assert!(policy.allows(CallKind::Indirect));
        assert!(!policy.allows(CallKind::Virtual));
    }

    #[test]
    fn test_builder_pattern() {
        let config = EmitterConfig::default()
            .label_policy(LabelPolicy::Lenient)
            .reinit_reused_locals(false)
            .optimizer(OptimizerConfig::disabled().elide_casts(true));

        assert_eq!(config.label_policy, LabelPolicy::Lenient);
        assert!(!config.reinit_reused_locals);
        assert!(config.optimizer.elide_casts);
        assert!(!config.optimizer.shorten_branches);
    }
}

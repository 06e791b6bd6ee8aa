//! Log tag definitions, one per subsystem
//!
//! Tags drive both the colored console prefix and the per-module debug flag
//! lookup (`--debug-<key>`).

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogTag {
    System,
    Scheduler,
    Signal,
    Gate,
    Transition,
    Ledger,
    Exchange,
    Executor,
    Database,
    Notify,
    Test,
}

impl LogTag {
    /// Key used for --debug-<key> command-line gating
    pub fn to_debug_key(&self) -> String {
        match self {
            LogTag::System => "system",
            LogTag::Scheduler => "scheduler",
            LogTag::Signal => "signal",
            LogTag::Gate => "gate",
            LogTag::Transition => "transition",
            LogTag::Ledger => "ledger",
            LogTag::Exchange => "exchange",
            LogTag::Executor => "executor",
            LogTag::Database => "database",
            LogTag::Notify => "notify",
            LogTag::Test => "test",
        }
        .to_string()
    }

    /// Uncolored display string for file output
    pub fn to_plain_string(&self) -> &'static str {
        match self {
            LogTag::System => "SYSTEM",
            LogTag::Scheduler => "SCHEDULER",
            LogTag::Signal => "SIGNAL",
            LogTag::Gate => "GATE",
            LogTag::Transition => "TRANSITION",
            LogTag::Ledger => "LEDGER",
            LogTag::Exchange => "EXCHANGE",
            LogTag::Executor => "EXECUTOR",
            LogTag::Database => "DATABASE",
            LogTag::Notify => "NOTIFY",
            LogTag::Test => "TEST",
        }
    }
}

impl std::fmt::Display for LogTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_plain_string())
    }
}

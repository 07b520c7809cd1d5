//! Composable transaction parameters.
//!
//! Each knob is its own type implementing [`TxOption`]; a call site passes
//! any combination and they are folded in order into one [`TxOptions`].
//! A later option for the same knob overrides an earlier one.

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub access_mode: Option<TxAccessMode>,
    pub iso_level: Option<TxIsoLevel>,
    pub deferrable_mode: Option<TxDeferrableMode>,
    pub begin_query: Option<String>,
}

pub trait TxOption: Send + Sync {
    fn apply(&self, opts: TxOptions) -> TxOptions;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAccessMode {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxIsoLevel {
    Serializable,
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDeferrableMode {
    Deferrable,
    NotDeferrable,
}

/// Statement issued right after `BEGIN` instead of the generated
/// `SET TRANSACTION`. It runs inside the open transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxBeginQuery(pub String);

impl TxOption for TxAccessMode {
    fn apply(&self, mut opts: TxOptions) -> TxOptions {
        opts.access_mode = Some(*self);
        opts
    }
}

impl TxOption for TxIsoLevel {
    fn apply(&self, mut opts: TxOptions) -> TxOptions {
        opts.iso_level = Some(*self);
        opts
    }
}

impl TxOption for TxDeferrableMode {
    fn apply(&self, mut opts: TxOptions) -> TxOptions {
        opts.deferrable_mode = Some(*self);
        opts
    }
}

impl TxOption for TxBeginQuery {
    fn apply(&self, mut opts: TxOptions) -> TxOptions {
        opts.begin_query = Some(self.0.clone());
        opts
    }
}

impl fmt::Display for TxAccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxAccessMode::ReadWrite => write!(f, "READ WRITE"),
            TxAccessMode::ReadOnly => write!(f, "READ ONLY"),
        }
    }
}

impl fmt::Display for TxIsoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxIsoLevel::Serializable => write!(f, "ISOLATION LEVEL SERIALIZABLE"),
            TxIsoLevel::RepeatableRead => write!(f, "ISOLATION LEVEL REPEATABLE READ"),
            TxIsoLevel::ReadCommitted => write!(f, "ISOLATION LEVEL READ COMMITTED"),
            TxIsoLevel::ReadUncommitted => write!(f, "ISOLATION LEVEL READ UNCOMMITTED"),
        }
    }
}

impl fmt::Display for TxDeferrableMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxDeferrableMode::Deferrable => write!(f, "DEFERRABLE"),
            TxDeferrableMode::NotDeferrable => write!(f, "NOT DEFERRABLE"),
        }
    }
}

impl TxOptions {
    pub fn fold(params: &[&dyn TxOption]) -> Self {
        params.iter().fold(TxOptions::default(), |opts, param| param.apply(opts))
    }

    /// The statement to run after `BEGIN`, if any knob was set.
    pub fn setup_statement(&self) -> Option<String> {
        if let Some(query) = &self.begin_query {
            return Some(query.clone());
        }

        let mut modes = Vec::with_capacity(3);
        if let Some(level) = self.iso_level {
            modes.push(level.to_string());
        }
        if let Some(mode) = self.access_mode {
            modes.push(mode.to_string());
        }
        if let Some(mode) = self.deferrable_mode {
            modes.push(mode.to_string());
        }

        if modes.is_empty() {
            None
        } else {
            Some(format!("SET TRANSACTION {}", modes.join(", ")))
        }
    }
}

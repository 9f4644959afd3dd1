//! Handles on values that live in the remote interpreter.
//!
//! Every call result is kept by the remote under its command index in
//! `::tclbridge::results`. A [`RemoteRef`] names that slot, so passing it as
//! an argument hands the remote its own object back instead of a re-parsed
//! copy of the string form.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

/// Remote array holding every call result, keyed by command index.
pub const RESULTS_ARRAY: &str = "::tclbridge::results";

/// Identifies one session; references never cross sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of one successful call: the cached string form plus the remote
/// slot holding the actual value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    session: SessionId,
    cmd_idx: u64,
    value: String,
    command: String,
}

impl RemoteRef {
    pub(crate) fn new(session: SessionId, cmd_idx: u64, value: String, command: String) -> Self {
        Self {
            session,
            cmd_idx,
            value,
            command,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn cmd_idx(&self) -> u64 {
        self.cmd_idx
    }

    /// The command that produced this value.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Cached string form of the value.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_string(self) -> String {
        self.value
    }

    /// Tcl expression that evaluates to the original remote value.
    pub fn expr(&self) -> String {
        format!("${}({})", RESULTS_ARRAY, self.cmd_idx)
    }

    /// Parse the cached string form.
    pub fn parse<T: FromStr>(&self) -> Result<T, T::Err> {
        self.value.trim().parse()
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl AsRef<str> for RemoteRef {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl From<RemoteRef> for String {
    fn from(r: RemoteRef) -> Self {
        r.value
    }
}

/// Append-only store of call results on the remote side.
///
/// Entries are never freed; the store lives as long as the remote.
#[derive(Debug, Clone)]
pub struct ResultStore<V> {
    results: Vec<V>,
}

impl<V> Default for ResultStore<V> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
        }
    }
}

impl<V> ResultStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result; returns its index.
    pub fn push(&mut self, value: V) -> u64 {
        self.results.push(value);
        (self.results.len() - 1) as u64
    }

    pub fn get(&self, idx: u64) -> Option<&V> {
        usize::try_from(idx).ok().and_then(|i| self.results.get(i))
    }

    /// Index the next stored result will get.
    pub fn next_idx(&self) -> u64 {
        self.results.len() as u64
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Parse `$::tclbridge::results(N)` (leading `$` optional) into `N`.
pub fn parse_result_expr(text: &str) -> Option<u64> {
    let text = text.strip_prefix('$').unwrap_or(text);
    let rest = text
        .strip_prefix(RESULTS_ARRAY)
        .or_else(|| text.strip_prefix(&RESULTS_ARRAY[2..]))?;
    rest.strip_prefix('(')?.strip_suffix(')')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(idx: u64, value: &str) -> RemoteRef {
        RemoteRef::new(SessionId::new(), idx, value.into(), "expr 3 * 5".into())
    }

    #[test]
    fn expr_names_the_results_slot() {
        assert_eq!(sample(0, "15").expr(), "$::tclbridge::results(0)");
        assert_eq!(sample(42, "x").expr(), "$::tclbridge::results(42)");
    }

    #[test]
    fn string_conversions_use_cached_value() {
        let r = sample(0, "15");
        assert_eq!(r.to_string(), "15");
        assert_eq!(r.as_str(), "15");
        assert_eq!(r.parse::<i64>().unwrap(), 15);
        assert_eq!(r.parse::<f64>().unwrap(), 15.0);
        assert!(r.parse::<bool>().is_err());
        assert_eq!(String::from(r), "15");
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn result_store_is_append_only() {
        let mut store = ResultStore::new();
        assert_eq!(store.next_idx(), 0);
        assert_eq!(store.push("a"), 0);
        assert_eq!(store.push("b"), 1);
        assert_eq!(store.get(0), Some(&"a"));
        assert_eq!(store.get(1), Some(&"b"));
        assert_eq!(store.get(2), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn result_expr_parses_back() {
        assert_eq!(parse_result_expr("$::tclbridge::results(7)"), Some(7));
        assert_eq!(parse_result_expr("tclbridge::results(12)"), Some(12));
        assert_eq!(parse_result_expr("$::tclbridge::results(x)"), None);
        assert_eq!(parse_result_expr("$other(1)"), None);
        assert_eq!(parse_result_expr(&sample(9, "").expr()), Some(9));
    }
}

//! Turning Rust arguments into Tcl command text.
//!
//! Every scalar becomes a single Tcl word. Braces are used whenever they
//! preserve the text exactly; otherwise special characters are escaped with
//! backslashes. A top-level [`RemoteRef`] is passed as its registry
//! expression so the remote sees its original object.

use std::fmt::Write as _;

use crate::reference::RemoteRef;

/// One argument of a Tcl command.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Int(i64),
    Float(f64),
    /// Rendered as `1` / `0`. As a keyword value it toggles a bare `-flag`.
    Bool(bool),
    List(Vec<Arg>),
    /// Flattened into a key/value list.
    Dict(Vec<(Arg, Arg)>),
    Ref(RemoteRef),
}

impl Arg {
    /// Render as a word in argument position.
    fn word(&self) -> String {
        match self {
            Self::Ref(r) => r.expr(),
            other => other.nested_word(),
        }
    }

    /// Render as an element inside a list or dict.
    fn nested_word(&self) -> String {
        match self {
            Self::Str(s) => quote(s),
            Self::Int(i) => quote(&i.to_string()),
            Self::Float(f) => quote(&format!("{f:?}")),
            Self::Bool(b) => quote(if *b { "1" } else { "0" }),
            Self::List(items) => {
                let inner: Vec<String> = items.iter().map(Arg::nested_word).collect();
                quote(&inner.join(" "))
            }
            Self::Dict(pairs) => {
                let inner: Vec<String> = pairs
                    .iter()
                    .flat_map(|(k, v)| [k.nested_word(), v.nested_word()])
                    .collect();
                quote(&inner.join(" "))
            }
            Self::Ref(r) => quote(r.as_str()),
        }
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a RemoteRef>) {
        match self {
            Self::Ref(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|a| a.collect_refs(out)),
            Self::Dict(pairs) => pairs.iter().for_each(|(k, v)| {
                k.collect_refs(out);
                v.collect_refs(out);
            }),
            _ => {}
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Arg {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for Arg {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Arg {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<RemoteRef> for Arg {
    fn from(r: RemoteRef) -> Self {
        Self::Ref(r)
    }
}

impl From<&RemoteRef> for Arg {
    fn from(r: &RemoteRef) -> Self {
        Self::Ref(r.clone())
    }
}

impl<T: Into<Arg>> From<Vec<T>> for Arg {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

/// Braces keep `text` verbatim only when they balance, the text does not end
/// in an unpaired backslash, and it holds no backslash-newline.
fn can_brace(text: &str) -> bool {
    let mut depth: usize = 0;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                None | Some('\n') => return false,
                Some(_) => {}
            },
            '{' => depth += 1,
            '}' => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            _ => {}
        }
    }
    depth == 0
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{0b}' => out.push_str("\\v"),
            '\u{0c}' => out.push_str("\\f"),
            '\\' | '{' | '}' | '[' | ']' | '$' | '"' | ';' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Quote `text` as a single Tcl word.
pub fn quote(text: &str) -> String {
    if can_brace(text) {
        format!("{{{text}}}")
    } else {
        escape(text)
    }
}

/// Where the target object goes in an object-method call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ObjectPosition {
    /// `$obj method args...`
    First,
    /// `method $obj args...`
    #[default]
    Second,
    /// `method args... $obj`
    Last,
}

impl std::str::FromStr for ObjectPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "second" => Ok(Self::Second),
            "last" => Ok(Self::Last),
            other => Err(format!("unknown object position '{other}'")),
        }
    }
}

/// A Tcl command under construction.
///
/// ```
/// use tclbridge::Invocation;
///
/// let cmd = Invocation::new("read_verilog")
///     .flag("sv", true)
///     .kwarg("lib", "cells")
///     .arg("top.v");
/// assert_eq!(cmd.render(), "read_verilog -sv -lib {cells} {top.v}");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    name: String,
    args: Vec<Arg>,
    kwargs: Vec<(String, Arg)>,
}

impl Invocation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `-key value`. A boolean value acts as [`flag`](Self::flag).
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Arg>) -> Self {
        self.kwargs.push((key.into(), value.into()));
        self
    }

    /// `-key` when `on`, nothing otherwise.
    pub fn flag(self, key: impl Into<String>, on: bool) -> Self {
        self.kwarg(key, Arg::Bool(on))
    }

    /// Every remote reference among the arguments, nested ones included.
    pub fn refs(&self) -> Vec<&RemoteRef> {
        let mut out = Vec::new();
        for (_, v) in &self.kwargs {
            v.collect_refs(&mut out);
        }
        for a in &self.args {
            a.collect_refs(&mut out);
        }
        out
    }

    fn push_kwargs(&self, out: &mut String) {
        for (key, value) in &self.kwargs {
            match value {
                Arg::Bool(true) => {
                    let _ = write!(out, " -{key}");
                }
                Arg::Bool(false) => {}
                other => {
                    let _ = write!(out, " -{key} {}", other.word());
                }
            }
        }
    }

    fn push_args(&self, out: &mut String) {
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.word());
        }
    }

    /// Command text: name, keyword arguments, then positional arguments.
    pub fn render(&self) -> String {
        let mut out = self.name.clone();
        self.push_kwargs(&mut out);
        self.push_args(&mut out);
        out
    }

    /// Command text for a method call on `target`.
    pub fn render_on(&self, target: &RemoteRef, position: ObjectPosition) -> String {
        let target = target.expr();
        let mut out = String::new();
        match position {
            ObjectPosition::First => {
                out.push_str(&target);
                out.push(' ');
                out.push_str(&self.name);
                self.push_kwargs(&mut out);
                self.push_args(&mut out);
            }
            ObjectPosition::Second => {
                out.push_str(&self.name);
                out.push(' ');
                out.push_str(&target);
                self.push_kwargs(&mut out);
                self.push_args(&mut out);
            }
            ObjectPosition::Last => {
                out.push_str(&self.name);
                self.push_kwargs(&mut out);
                self.push_args(&mut out);
                out.push(' ');
                out.push_str(&target);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::SessionId;

    fn remote(idx: u64, value: &str) -> RemoteRef {
        RemoteRef::new(SessionId::new(), idx, value.into(), "create_box 1".into())
    }

    #[test]
    fn scalars_are_braced() {
        assert_eq!(quote("just a string"), "{just a string}");
        assert_eq!(quote(""), "{}");
        assert_eq!(Arg::from(15).word(), "{15}");
        assert_eq!(Arg::from(2.5).word(), "{2.5}");
        assert_eq!(Arg::from(2.0).word(), "{2.0}");
        assert_eq!(Arg::from(true).word(), "{1}");
        assert_eq!(Arg::from(false).word(), "{0}");
    }

    #[test]
    fn special_characters_stay_inside_braces() {
        assert_eq!(quote("$x [y] \"z\"; w"), "{$x [y] \"z\"; w}");
        assert_eq!(quote("a {nested} b"), "{a {nested} b}");
        assert_eq!(quote("multi\nline"), "{multi\nline}");
        assert_eq!(quote("c:\\path"), "{c:\\path}");
    }

    #[test]
    fn unbalanced_text_is_escaped() {
        assert_eq!(quote("a}"), "a\\}");
        assert_eq!(quote("{a"), "\\{a");
        assert_eq!(quote("} {"), "\\}\\ \\{");
        assert_eq!(quote("ends with \\"), "ends\\ with\\ \\\\");
        assert_eq!(quote("line\\\nnext"), "line\\\\\\nnext");
        assert_eq!(quote("x $y}"), "x\\ \\$y\\}");
        assert_eq!(quote("a}\u{0b}b"), "a\\}\\vb");
        assert_eq!(quote("a}\u{0c}b"), "a\\}\\fb");
    }

    #[test]
    fn escaped_braces_do_not_count() {
        assert_eq!(quote("a\\{"), "{a\\{}");
        assert!(!can_brace("}{"));
    }

    #[test]
    fn lists_and_dicts() {
        assert_eq!(Arg::from(vec!["hello", "world"]).word(), "{{hello} {world}}");
        assert_eq!(Arg::from(Vec::<&str>::new()).word(), "{}");
        let nested = Arg::List(vec![Arg::from("a b"), Arg::from(vec![1, 2])]);
        assert_eq!(nested.word(), "{{a b} {{1} {2}}}");
        let dict = Arg::Dict(vec![
            (Arg::from("width"), Arg::from(8)),
            (Arg::from("name"), Arg::from("top level")),
        ]);
        assert_eq!(dict.word(), "{{width} {8} {name} {top level}}");
    }

    #[test]
    fn top_level_ref_uses_registry_expression() {
        let r = remote(4, "box");
        assert_eq!(Arg::from(&r).word(), "$::tclbridge::results(4)");
        assert_eq!(
            Invocation::new("unwrap_box").arg(&r).render(),
            "unwrap_box $::tclbridge::results(4)"
        );
    }

    #[test]
    fn nested_ref_uses_display_string() {
        let r = remote(4, "box");
        assert_eq!(Arg::from(vec![r]).word(), "{{box}}");
    }

    #[test]
    fn kwargs_precede_positionals() {
        let cmd = Invocation::new("synth")
            .arg("top")
            .kwarg("flatten", true)
            .kwarg("noabc", false)
            .kwarg("run", "begin:fine")
            .kwarg("depth", 3);
        assert_eq!(cmd.render(), "synth -flatten -run {begin:fine} -depth {3} {top}");
    }

    #[test]
    fn object_positions() {
        let obj = remote(2, "box");
        let call = Invocation::new("configure").flag("v", true).arg("x");
        assert_eq!(
            call.render_on(&obj, ObjectPosition::First),
            "$::tclbridge::results(2) configure -v {x}"
        );
        assert_eq!(
            call.render_on(&obj, ObjectPosition::Second),
            "configure $::tclbridge::results(2) -v {x}"
        );
        assert_eq!(
            call.render_on(&obj, ObjectPosition::Last),
            "configure -v {x} $::tclbridge::results(2)"
        );
    }

    #[test]
    fn refs_are_collected_recursively() {
        let a = remote(0, "a");
        let b = remote(1, "b");
        let c = remote(2, "c");
        let cmd = Invocation::new("f")
            .arg(&a)
            .arg(vec![Arg::from(&b)])
            .kwarg("opt", Arg::Dict(vec![(Arg::from("k"), Arg::from(&c))]));
        let idxs: Vec<u64> = cmd.refs().iter().map(|r| r.cmd_idx()).collect();
        assert_eq!(idxs, [2, 0, 1]);
    }

    #[test]
    fn object_position_parses() {
        assert_eq!("first".parse::<ObjectPosition>().unwrap(), ObjectPosition::First);
        assert_eq!("LAST".parse::<ObjectPosition>().unwrap(), ObjectPosition::Last);
        assert!("middle".parse::<ObjectPosition>().is_err());
    }
}

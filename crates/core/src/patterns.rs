//! Shared fragment patterns for the smali grammar subset the passes consume.
//!
//! Every pattern is an explicit line/token scanner. A scanner returns `None`
//! for any shape it does not recognize, which callers treat as "leave this
//! line alone" or "skip this file", never as an error.

use std::fmt;

/// Line separator used for every generated line.
#[cfg(windows)]
pub const LS: &str = "\r\n";
/// Line separator used for every generated line.
#[cfg(not(windows))]
pub const LS: &str = "\n";

/// Generated instructions are indented with a single tab.
pub const TAB: char = '\t';

/// Parsed `.class` / `.source` header of a smali file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassHeader {
    /// Visibility and modifier flags, e.g. `public final`.
    pub flags: String,
    /// Fully qualified class descriptor, e.g. `Lcom/app/Foo;`.
    pub name: String,
    /// The `.source` tag. Distinct classes split out of one compilation
    /// source share this tag.
    pub source: String,
}

impl ClassHeader {
    pub fn is_public(&self) -> bool {
        self.flags.split_whitespace().any(|f| f == "public")
    }
}

/// Locates the class header. Both the `.class` line and a `.source` tag must
/// be present; a file without them is not a rewritable class file.
pub fn parse_class_header(text: &str) -> Option<ClassHeader> {
    let mut flags = None;
    let mut name = None;
    for line in text.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix(".class ") {
            let rest = rest.trim();
            let (f, n) = match rest.rsplit_once(char::is_whitespace) {
                Some((f, n)) => (f.trim_end(), n),
                None => ("", rest),
            };
            if n.starts_with('L') && n.ends_with(';') {
                flags = Some(f.to_string());
                name = Some(n.to_string());
            }
        } else if let Some(rest) = line.strip_prefix(".source ") {
            let tag = rest.trim().strip_prefix('"')?.strip_suffix('"')?;
            return Some(ClassHeader {
                flags: flags?,
                name: name?,
                source: tag.to_string(),
            });
        }
    }
    None
}

/// Whether a call instruction dispatches statically or through the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Static,
    Virtual,
}

impl DispatchKind {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Virtual => "virtual",
        }
    }
}

impl fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A located occurrence of a call instruction. Exists only during a single
/// scan of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSite {
    pub kind: DispatchKind,
    /// Raw register list including the braces, e.g. `{v0, v1}`.
    pub registers: String,
    /// Target class descriptor, e.g. `Ljava/lang/String;`.
    pub class: String,
    pub method: String,
    /// Raw parameter string between the parentheses.
    pub params: String,
    /// `V` for void, otherwise the raw return descriptor.
    pub return_type: String,
}

impl InvocationSite {
    /// Fully qualified signature, `Lcls;->name(params)ret`.
    pub fn signature(&self) -> String {
        format!(
            "{}->{}({}){}",
            self.class, self.method, self.params, self.return_type
        )
    }

    pub fn is_void(&self) -> bool {
        self.return_type == "V"
    }

    /// Number of register tokens in the raw register list. For virtual
    /// dispatch the receiver is the first of them.
    pub fn register_count(&self) -> usize {
        register_tokens(&self.registers).len()
    }
}

/// Parses an `invoke-virtual` / `invoke-static` instruction line.
///
/// Range variants and the other dispatch kinds are rejected: call sites the
/// passes cannot rewrite must fall through untouched.
pub fn parse_invocation(line: &str) -> Option<InvocationSite> {
    let rest = line.trim_start().strip_prefix("invoke-")?;
    let (kind_str, rest) = rest.split_once(' ')?;
    let kind = match kind_str {
        "static" => DispatchKind::Static,
        "virtual" => DispatchKind::Virtual,
        _ => return None,
    };
    let rest = rest.trim_start();
    if !rest.starts_with('{') {
        return None;
    }
    let close = rest.find('}')?;
    let registers = &rest[..=close];
    let rest = rest[close + 1..].strip_prefix(", ")?;
    let arrow = rest.find("->")?;
    let class = &rest[..arrow];
    if !class.ends_with(';') {
        return None;
    }
    let rest = &rest[arrow + 2..];
    let open = rest.find('(')?;
    let paren = rest.find(')')?;
    if paren < open {
        return None;
    }
    let return_type = rest[paren + 1..].trim_end();
    if return_type.is_empty() {
        return None;
    }
    Some(InvocationSite {
        kind,
        registers: registers.to_string(),
        class: class.to_string(),
        method: rest[..open].to_string(),
        params: rest[open + 1..paren].to_string(),
        return_type: return_type.to_string(),
    })
}

/// Extracts every `v<n>` / `p<n>` register token in order of appearance.
pub fn register_tokens(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if (bytes[i] == b'v' || bytes[i] == b'p')
            && i + 1 < bytes.len()
            && bytes[i + 1].is_ascii_digit()
        {
            let start = i;
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            out.push(&s[start..i]);
        } else {
            i += 1;
        }
    }
    out
}

/// Parses a `.locals <n>` directive line.
pub fn parse_locals(line: &str) -> Option<usize> {
    line.trim_start().strip_prefix(".locals ")?.trim().parse().ok()
}

/// Rebuilds a `.locals` line with a new count, preserving the indentation.
pub fn with_locals(line: &str, locals: usize) -> String {
    let indent = &line[..line.len() - line.trim_start().len()];
    format!("{indent}.locals {locals}")
}

/// A `.field <modifiers> <name>:<descriptor>` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub modifiers: String,
    pub name: String,
    pub descriptor: String,
}

/// Parses a field declaration line, tolerating a trailing ` = <value>`
/// initializer.
pub fn parse_field(line: &str) -> Option<FieldDecl> {
    let rest = line.trim_start().strip_prefix(".field ")?;
    let colon = rest.find(':')?;
    let head = rest[..colon].trim_end();
    let descriptor = rest[colon + 1..].split_whitespace().next()?;
    let (modifiers, name) = match head.rsplit_once(char::is_whitespace) {
        Some((m, n)) => (m.trim_end(), n),
        None => ("", head),
    };
    Some(FieldDecl {
        modifiers: modifiers.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    })
}

/// A `const-string` / `const-string/jumbo` load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstString {
    pub mnemonic: String,
    pub register: String,
    /// Literal text between the quotes, escapes untouched.
    pub literal: String,
}

pub fn parse_const_string(line: &str) -> Option<ConstString> {
    let trimmed = line.trim_start();
    let (mnemonic, rest) = if let Some(r) = trimmed.strip_prefix("const-string/jumbo ") {
        ("const-string/jumbo", r)
    } else if let Some(r) = trimmed.strip_prefix("const-string ") {
        ("const-string", r)
    } else {
        return None;
    };
    let (register, rest) = rest.split_once(", ")?;
    let literal = rest.trim_end().strip_prefix('"')?.strip_suffix('"')?;
    Some(ConstString {
        mnemonic: mnemonic.to_string(),
        register: register.to_string(),
        literal: literal.to_string(),
    })
}

/// Rewrites every `.method … .end method` block in `text`.
///
/// `f` receives the header line (without its terminator) and the body (the
/// full lines strictly between header and `.end method`, terminators
/// included) and returns a replacement body, or `None` to leave the method
/// untouched. Everything outside method bodies is preserved byte for byte.
pub fn rewrite_methods<F>(text: &str, mut f: F) -> String
where
    F: FnMut(&str, &str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut lines = text.split_inclusive('\n');
    while let Some(line) = lines.next() {
        out.push_str(line);
        if !line.trim_start().starts_with(".method ") {
            continue;
        }
        let mut body = String::new();
        let mut end_line = None;
        for inner in lines.by_ref() {
            if inner.trim_start().starts_with(".end method") {
                end_line = Some(inner);
                break;
            }
            body.push_str(inner);
        }
        let Some(end_line) = end_line else {
            // Unterminated method: emit what we buffered and stop rewriting.
            out.push_str(&body);
            break;
        };
        match f(line.trim_end_matches(['\r', '\n']), &body) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(&body),
        }
        out.push_str(end_line);
    }
    out
}

//! Advanced reflection: routes calls to catalogued dangerous APIs through a
//! shared reflective dispatcher.
//!
//! Rewritten sites box their primitive arguments, marshal everything into an
//! `Object[]`, and call the dispatcher with a method index. A companion
//! class, materialized once per project, resolves the matching
//! `java.lang.reflect.Method` objects at the same indexes.

use std::fs;
use std::path::{Path, PathBuf};

use dexcloak_core::catalog::DangerousApiCatalog;
use dexcloak_core::patterns::{self, DispatchKind, InvocationSite, LS, TAB};
use dexcloak_core::scanner::{self, PathFilter};
use dexcloak_core::smali::{self, SmaliFile};
use dexcloak_utils::errors::TransformError;
use rand::rngs::StdRng;
use tracing::debug;

use crate::{PassReport, Transform};

const DEFAULT_EXCLUDES: [&str; 4] = ["android", "androidx", "kotlin", "google"];

/// Most registers a rewritten method may have in play: declared locals plus
/// the argument registers of the reflected call.
const REGISTER_CEILING: usize = 11;

/// Scratch registers claimed per rewritten site, on top of the declared
/// locals.
const SCRATCH_REGISTERS: usize = 4;

/// Cap on instruction units accumulated into the companion class.
const COMPANION_INSTRUCTION_CAP: usize = 60000;

const DISPATCHER: &str = "Lcom/apireflectionmanager/AdvancedApiReflection;->obfuscate(ILjava/lang/Object;[Ljava/lang/Object;)Ljava/lang/Object;";
const COMPANION_FILE: &str = "AdvancedApiReflection.smali";
const COMPANION_MARKER: &str = "#!code_to_replace!#";
const COMPANION_TEMPLATE: &str = include_str!("templates/advanced_api_reflection.smali");
const DEFAULT_CATALOG: &str = include_str!("templates/dangerous_api.txt");

pub struct AdvancedReflection {
    root: PathBuf,
    filter: PathFilter,
    catalog: DangerousApiCatalog,
}

impl std::fmt::Debug for AdvancedReflection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvancedReflection")
            .field("root", &self.root)
            .field("catalog", &self.catalog.len())
            .finish()
    }
}

impl AdvancedReflection {
    /// Pass over the package directory `root` with the built-in catalog.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            filter: PathFilter::excluding(DEFAULT_EXCLUDES),
            catalog: DangerousApiCatalog::parse(DEFAULT_CATALOG),
        }
    }

    pub fn with_catalog(mut self, catalog: DangerousApiCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Per-invocation companion state: the next dispatcher index and the
/// instruction units already accumulated.
#[derive(Default)]
struct CompanionState {
    method_index: usize,
    instruction_units: usize,
    registration: String,
}

impl Transform for AdvancedReflection {
    fn name(&self) -> &'static str {
        "AdvancedReflection"
    }

    fn apply(&self, _rng: &mut StdRng) -> Result<PassReport, TransformError> {
        let mut report = PassReport::default();
        let files = scanner::collect_files(&self.root, Some("smali"), &self.filter)?;
        let mut state = CompanionState::default();
        for path in &files {
            if state.instruction_units >= COMPANION_INSTRUCTION_CAP {
                debug!("companion instruction cap reached, leaving remaining files untouched");
                break;
            }
            let mut file = SmaliFile::read(path)?;
            let before = state.method_index;
            let rewritten = patterns::rewrite_methods(file.text(), |_, body| {
                rewrite_method(body, &self.catalog, &mut state)
            });
            if state.method_index > before {
                report.mutations += state.method_index - before;
                report.files_rewritten += 1;
                file.rewrite(rewritten)?;
            }
        }
        if state.method_index > 0 {
            materialize_companion(&self.root, &state.registration)?;
            report.methods_synthesized = state.method_index;
        }
        Ok(report)
    }
}

fn rewrite_method(
    body: &str,
    catalog: &DangerousApiCatalog,
    state: &mut CompanionState,
) -> Option<String> {
    let mut locals = body.lines().find_map(patterns::parse_locals).unwrap_or(16);
    let mut out = String::with_capacity(body.len());
    let mut changed = false;
    let mut lines = body.split_inclusive('\n').peekable();
    while let Some(line) = lines.next() {
        let site = match patterns::parse_invocation(line) {
            Some(site) if catalog.contains(&site.signature()) => site,
            _ => {
                out.push_str(line);
                continue;
            }
        };
        let tokens = split_parameters(&site.params);
        if locals + register_cost(&tokens) > REGISTER_CEILING {
            // Not enough registers to marshal through the dispatcher.
            out.push_str(line);
            continue;
        }
        let Some(sources) = argument_sources(&site, &tokens) else {
            out.push_str(line);
            continue;
        };

        // Consume an attached move-result: the next non-blank line, when it
        // is one.
        let mut gap = String::new();
        let mut move_result: Option<String> = None;
        while let Some(next) = lines.peek() {
            if next.trim().is_empty() {
                gap.push_str(next);
                lines.next();
            } else {
                if next.trim_start().starts_with("move-result") {
                    move_result = lines.next().map(str::to_string);
                }
                break;
            }
        }

        let indent = &line[..line.len() - line.trim_start().len()];
        out.push_str(&dispatch_block(&site, &tokens, &sources, locals, state.method_index, indent));
        if let Some(ref mr) = move_result {
            out.push_str(&result_block(&site.return_type, mr));
        } else {
            out.push_str(&gap);
        }

        state.registration.push_str(&registration_code(
            &site.class,
            &site.method,
            &tokens,
            &mut state.instruction_units,
        ));
        state.method_index += 1;
        locals += SCRATCH_REGISTERS;
        changed = true;
    }
    if !changed {
        return None;
    }
    // The scratch registers claimed above become part of the method's
    // declared locals.
    let updated = out
        .split_inclusive('\n')
        .scan(false, |done, l| {
            if !*done && patterns::parse_locals(l).is_some() {
                *done = true;
                let eol = if l.ends_with('\n') { LS } else { "" };
                Some(format!("{}{eol}", patterns::with_locals(l.trim_end_matches(['\r', '\n']), locals)))
            } else {
                Some(l.to_string())
            }
        })
        .collect();
    Some(updated)
}

/// Splits a raw parameter string into descriptor tokens: primitives,
/// `L…;` classes, and `[`-prefixed arrays (object-like at the dispatch
/// boundary).
fn split_parameters(params: &str) -> Vec<String> {
    let bytes = params.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i] == b'[' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        if bytes[i] == b'L' {
            match params[i..].find(';') {
                Some(semi) => i += semi + 1,
                None => i = bytes.len(),
            }
        } else {
            i += 1;
        }
        out.push(params[start..i].to_string());
    }
    out
}

/// Registers needed to pass the arguments: wide primitives take two.
fn register_cost(tokens: &[String]) -> usize {
    tokens
        .iter()
        .map(|t| if t == "J" || t == "D" { 2 } else { 1 })
        .sum()
}

/// Maps each parameter token to the register(s) holding its value at the
/// call site. `None` when the register list is too short for the signature.
fn argument_sources(site: &InvocationSite, tokens: &[String]) -> Option<Vec<String>> {
    let regs = patterns::register_tokens(&site.registers);
    let mut index = match site.kind {
        DispatchKind::Virtual => 1,
        DispatchKind::Static => 0,
    };
    let mut sources = Vec::with_capacity(tokens.len());
    for t in tokens {
        if t == "J" || t == "D" {
            if index + 1 >= regs.len() {
                return None;
            }
            sources.push(format!("{}, {}", regs[index], regs[index + 1]));
            index += 2;
        } else {
            if index >= regs.len() {
                return None;
            }
            sources.push(regs[index].to_string());
            index += 1;
        }
    }
    if site.kind == DispatchKind::Virtual && regs.is_empty() {
        return None;
    }
    Some(sources)
}

/// Emits the boxing, array marshalling and dispatcher call replacing the
/// original invocation. Scratch registers are `v<locals>`..`v<locals+3>`.
fn dispatch_block(
    site: &InvocationSite,
    tokens: &[String],
    sources: &[String],
    locals: usize,
    method_index: usize,
    indent: &str,
) -> String {
    let (r1, r2, r3, r4) = (
        format!("v{locals}"),
        format!("v{}", locals + 1),
        format!("v{}", locals + 2),
        format!("v{}", locals + 3),
    );
    let mut code = format!("{indent}const/4 {r1}, 0x{:X}{LS}{LS}", tokens.len());
    if !tokens.is_empty() {
        code.push_str(&format!("{TAB}new-array {r1}, {r1}, [Ljava/lang/Object;{LS}{LS}"));
        for (i, (token, source)) in tokens.iter().zip(sources).enumerate() {
            match box_call(token) {
                Some(boxing) => {
                    code.push_str(&format!("{TAB}invoke-static {{{source}}}, {boxing}{LS}{LS}"));
                    code.push_str(&format!("{TAB}move-result-object {r2}{LS}{LS}"));
                    code.push_str(&format!("{TAB}const/4 {r4}, 0x{i:X}{LS}{LS}"));
                    code.push_str(&format!("{TAB}aput-object {r2}, {r1}, {r4}{LS}{LS}"));
                }
                None => {
                    code.push_str(&format!("{TAB}const/4 {r3}, 0x{i:X}{LS}{LS}"));
                    code.push_str(&format!("{TAB}aput-object {source}, {r1}, {r3}{LS}{LS}"));
                }
            }
        }
    }
    code.push_str(&format!("{TAB}const/16 {r3}, 0x{method_index:X}{LS}{LS}"));
    match site.kind {
        DispatchKind::Virtual => {
            let receiver = patterns::register_tokens(&site.registers)[0];
            code.push_str(&format!(
                "{TAB}invoke-static {{{r3}, {receiver}, {r1}}}, {DISPATCHER}{LS}"
            ));
        }
        DispatchKind::Static => {
            code.push_str(&format!("{TAB}const/4 {r4}, 0x0{LS}{LS}"));
            code.push_str(&format!(
                "{TAB}invoke-static {{{r3}, {r4}, {r1}}}, {DISPATCHER}{LS}"
            ));
        }
    }
    code
}

/// Re-expresses the original move-result: the dispatcher returns `Object`,
/// so the value is checked/cast and, for primitives, unboxed back into the
/// original target register.
fn result_block(return_type: &str, original_move_result: &str) -> String {
    let trimmed = original_move_result.trim();
    let target = trimmed.rsplit(' ').next().unwrap_or(trimmed);
    let mut code = format!("{LS}{TAB}move-result-object {target}{LS}{LS}");
    if return_type.starts_with('L') || return_type.starts_with('[') {
        code.push_str(&format!("{TAB}check-cast {target}, {return_type}{LS}"));
    } else {
        let wrapper = wrapper_class(return_type).unwrap_or("Ljava/lang/Object;");
        let unbox = unbox_call(return_type).unwrap_or("Ljava/lang/Object;->toString()Ljava/lang/String;");
        code.push_str(&format!("{TAB}check-cast {target}, {wrapper}{LS}{LS}"));
        code.push_str(&format!("{TAB}invoke-virtual {{{target}}}, {unbox}{LS}{LS}"));
        code.push_str(&format!("{TAB}{trimmed}{LS}"));
    }
    code
}

/// Code appended into the companion `<clinit>` to resolve and register the
/// `Method` object at the index the dispatcher expects. The unit counter
/// approximates dalvik instruction units, checked against the cap.
fn registration_code(
    class: &str,
    method: &str,
    tokens: &[String],
    units: &mut usize,
) -> String {
    let mut code = format!("{LS}{TAB}const/4 v1, 0x{:X}{LS}{LS}", tokens.len());
    *units += 1;
    if !tokens.is_empty() {
        code.push_str(&format!("{TAB}new-array v1, v1, [Ljava/lang/Class;{LS}{LS}"));
        *units += 2;
    }
    for (i, token) in tokens.iter().enumerate() {
        code.push_str(&format!("{TAB}const/4 v2, 0x{i:X}{LS}{LS}"));
        *units += 1;
        match class_constant(token) {
            Some(constant) => code.push_str(&format!("{TAB}sget-object v3, {constant}{LS}{LS}")),
            None => code.push_str(&format!("{TAB}const-class v3, {token}{LS}{LS}")),
        }
        *units += 2;
        code.push_str(&format!("{TAB}aput-object v3, v1, v2{LS}{LS}"));
        *units += 2;
    }
    code.push_str(&format!("{TAB}const-class v2, {class}{LS}{LS}"));
    code.push_str(&format!("{TAB}const-string v3, \"{method}\"{LS}{LS}"));
    *units += 4;
    code.push_str(&format!(
        "{TAB}invoke-virtual {{v2, v3, v1}}, Ljava/lang/Class;->getDeclaredMethod(Ljava/lang/String;[Ljava/lang/Class;)Ljava/lang/reflect/Method;{LS}{LS}"
    ));
    *units += 3;
    code.push_str(&format!("{TAB}move-result-object v1{LS}{LS}"));
    code.push_str(&format!(
        "{TAB}sget-object v2, Lcom/apireflectionmanager/AdvancedApiReflection;->obfuscatedMethods:Ljava/util/List;{LS}{LS}"
    ));
    *units += 3;
    code.push_str(&format!(
        "{TAB}invoke-interface {{v2, v1}}, Ljava/util/List;->add(Ljava/lang/Object;)Z{LS}"
    ));
    *units += 3;
    code
}

/// Creates the companion class under the file tree's smali root on first
/// use, then splices the accumulated registration code at the marker.
fn materialize_companion(root: &Path, registration: &str) -> Result<(), TransformError> {
    let smali_root = smali::smali_root(root)
        .ok_or_else(|| TransformError::NoSmaliRoot(root.display().to_string()))?;
    let path = smali_root
        .join("com")
        .join("apireflectionmanager")
        .join(COMPANION_FILE);
    if !path.exists() {
        smali::write_support_file(&path, COMPANION_TEMPLATE)?;
    }
    let text = fs::read_to_string(&path).map_err(|source| TransformError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    smali::write_support_file(&path, &text.replace(COMPANION_MARKER, registration))
}

fn wrapper_class(t: &str) -> Option<&'static str> {
    Some(match t {
        "I" => "Ljava/lang/Integer;",
        "Z" => "Ljava/lang/Boolean;",
        "B" => "Ljava/lang/Byte;",
        "S" => "Ljava/lang/Short;",
        "J" => "Ljava/lang/Long;",
        "F" => "Ljava/lang/Float;",
        "D" => "Ljava/lang/Double;",
        "C" => "Ljava/lang/Character;",
        _ => return None,
    })
}

fn class_constant(t: &str) -> Option<&'static str> {
    Some(match t {
        "I" => "Ljava/lang/Integer;->TYPE:Ljava/lang/Class;",
        "Z" => "Ljava/lang/Boolean;->TYPE:Ljava/lang/Class;",
        "B" => "Ljava/lang/Byte;->TYPE:Ljava/lang/Class;",
        "S" => "Ljava/lang/Short;->TYPE:Ljava/lang/Class;",
        "J" => "Ljava/lang/Long;->TYPE:Ljava/lang/Class;",
        "F" => "Ljava/lang/Float;->TYPE:Ljava/lang/Class;",
        "D" => "Ljava/lang/Double;->TYPE:Ljava/lang/Class;",
        "C" => "Ljava/lang/Character;->TYPE:Ljava/lang/Class;",
        _ => return None,
    })
}

fn box_call(t: &str) -> Option<&'static str> {
    Some(match t {
        "I" => "Ljava/lang/Integer;->valueOf(I)Ljava/lang/Integer;",
        "Z" => "Ljava/lang/Boolean;->valueOf(Z)Ljava/lang/Boolean;",
        "B" => "Ljava/lang/Byte;->valueOf(B)Ljava/lang/Byte;",
        "S" => "Ljava/lang/Short;->valueOf(S)Ljava/lang/Short;",
        "J" => "Ljava/lang/Long;->valueOf(J)Ljava/lang/Long;",
        "F" => "Ljava/lang/Float;->valueOf(F)Ljava/lang/Float;",
        "D" => "Ljava/lang/Double;->valueOf(D)Ljava/lang/Double;",
        "C" => "Ljava/lang/Character;->valueOf(C)Ljava/lang/Character;",
        _ => return None,
    })
}

fn unbox_call(t: &str) -> Option<&'static str> {
    Some(match t {
        "I" => "Ljava/lang/Integer;->intValue()I",
        "Z" => "Ljava/lang/Boolean;->booleanValue()Z",
        "B" => "Ljava/lang/Byte;->byteValue()B",
        "S" => "Ljava/lang/Short;->shortValue()S",
        "J" => "Ljava/lang/Long;->longValue()J",
        "F" => "Ljava/lang/Float;->floatValue()F",
        "D" => "Ljava/lang/Double;->doubleValue()D",
        "C" => "Ljava/lang/Character;->charValue()C",
        _ => return None,
    })
}

//! Interface Digest — a condensed, body-free public-surface summary of a
//! source artifact, used to bound the context a dependent task sees from
//! its dependency's result.
//!
//! Rust and TypeScript/JavaScript sources are parsed with `tree-sitter` the
//! way the teacher's `context_packer::ast_index` extracts `RustSymbol`s;
//! any other extension falls back to a dependency-free line-oriented
//! heuristic so the digest never hard-fails on an unvendored grammar.

use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Type,
    Interface,
    Enum,
    Class,
    Function,
    Variable,
}

impl SymbolKind {
    /// Digest output groups by kind in this order because downstream
    /// prompts read top-down.
    fn sort_rank(self) -> u8 {
        match self {
            Self::Type => 0,
            Self::Interface => 1,
            Self::Enum => 2,
            Self::Class => 3,
            Self::Function => 4,
            Self::Variable => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// The signature line(s), bodies stripped.
    pub signature: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DigestOptions {
    pub include_private: bool,
}

fn language_for(file_path: &str) -> Language {
    if file_path.ends_with(".ts") || file_path.ends_with(".tsx") {
        Language::TypeScript
    } else if file_path.ends_with(".js") || file_path.ends_with(".jsx") || file_path.ends_with(".mjs") {
        Language::JavaScript
    } else if file_path.ends_with(".rs") {
        Language::Rust
    } else {
        Language::Unknown
    }
}

enum Language {
    Rust,
    TypeScript,
    JavaScript,
    Unknown,
}

/// Extract symbols from `source`, dispatching on `file_path`'s extension.
pub fn digest_symbols(file_path: &str, source: &str, options: &DigestOptions) -> Vec<Symbol> {
    let mut symbols = match language_for(file_path) {
        Language::Rust => digest_rust(source),
        Language::TypeScript | Language::JavaScript => digest_typescript(source),
        Language::Unknown => digest_heuristic(source),
    };
    if !options.include_private {
        // Heuristic and grammar extractors already filter non-exported
        // items where the grammar makes that distinguishable; nothing
        // further to trim here, kept as an explicit hook for callers that
        // want to post-filter by name convention (e.g. leading `_`).
        symbols.retain(|s| !s.name.starts_with('_'));
    }
    symbols.sort_by_key(|s| (s.kind.sort_rank(), s.line));
    symbols
}

/// Render the grouped, body-free summary text consumed by downstream
/// prompts.
pub fn digest(file_path: &str, source: &str, options: &DigestOptions) -> String {
    let symbols = digest_symbols(file_path, source, options);
    if symbols.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    let mut last_kind: Option<SymbolKind> = None;
    for sym in &symbols {
        if last_kind != Some(sym.kind) {
            if last_kind.is_some() {
                out.push('\n');
            }
            out.push_str(&format!("## {:?}\n", sym.kind));
            last_kind = Some(sym.kind);
        }
        out.push_str(&sym.signature);
        out.push('\n');
    }
    out
}

fn digest_rust(source: &str) -> Vec<Symbol> {
    let mut parser = Parser::new();
    if parser.set_language(&tree_sitter_rust::LANGUAGE.into()).is_err() {
        return digest_heuristic(source);
    }
    let Some(tree) = parser.parse(source, None) else {
        return digest_heuristic(source);
    };
    let mut symbols = Vec::new();
    walk_rust(tree.root_node(), source.as_bytes(), &mut symbols);
    symbols
}

fn is_pub(node: Node, source: &[u8]) -> bool {
    node.prev_sibling()
        .map(|n| n.utf8_text(source).unwrap_or("").starts_with("pub"))
        .unwrap_or(false)
        || node
            .parent()
            .and_then(|p| p.child(0))
            .map(|n| n.utf8_text(source).unwrap_or("") == "pub")
            .unwrap_or(false)
}

fn header_line(node: Node, source: &[u8]) -> String {
    let text = node.utf8_text(source).unwrap_or("");
    text.lines().next().unwrap_or("").trim_end_matches('{').trim().to_string()
}

fn named_text(node: Node, source: &[u8]) -> Option<String> {
    node.child_by_field_name("name")
        .and_then(|n| n.utf8_text(source).ok())
        .map(|s| s.to_string())
}

fn walk_rust(node: Node, source: &[u8], out: &mut Vec<Symbol>) {
    let line = node.start_position().row + 1;
    match node.kind() {
        "function_item" => {
            if is_pub(node, source) {
                if let Some(name) = named_text(node, source) {
                    out.push(Symbol {
                        name,
                        kind: SymbolKind::Function,
                        signature: header_line(node, source),
                        line,
                    });
                }
            }
        }
        "struct_item" | "type_item" => {
            if is_pub(node, source) {
                if let Some(name) = named_text(node, source) {
                    out.push(Symbol {
                        name,
                        kind: SymbolKind::Type,
                        signature: header_line(node, source),
                        line,
                    });
                }
            }
        }
        "enum_item" => {
            if is_pub(node, source) {
                if let Some(name) = named_text(node, source) {
                    out.push(Symbol {
                        name,
                        kind: SymbolKind::Enum,
                        signature: header_line(node, source),
                        line,
                    });
                }
            }
        }
        "trait_item" => {
            if is_pub(node, source) {
                if let Some(name) = named_text(node, source) {
                    out.push(Symbol {
                        name,
                        kind: SymbolKind::Interface,
                        signature: header_line(node, source),
                        line,
                    });
                }
            }
        }
        _ => {}
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk_rust(child, source, out);
    }
}

fn digest_typescript(source: &str) -> Vec<Symbol> {
    let mut parser = Parser::new();
    let language = tree_sitter_typescript::LANGUAGE_TYPESCRIPT;
    if parser.set_language(&language.into()).is_err() {
        return digest_heuristic(source);
    }
    let Some(tree) = parser.parse(source, None) else {
        return digest_heuristic(source);
    };
    let mut symbols = Vec::new();
    walk_typescript(tree.root_node(), source.as_bytes(), &mut symbols);
    symbols
}

fn walk_typescript(node: Node, source: &[u8], out: &mut Vec<Symbol>) {
    let line = node.start_position().row + 1;
    let is_exported = |n: Node| {
        n.parent()
            .map(|p| p.kind() == "export_statement")
            .unwrap_or(false)
    };
    match node.kind() {
        "function_declaration" if is_exported(node) => {
            if let Some(name) = named_text(node, source) {
                out.push(Symbol {
                    name,
                    kind: SymbolKind::Function,
                    signature: header_line(node, source),
                    line,
                });
            }
        }
        "class_declaration" if is_exported(node) => {
            if let Some(name) = named_text(node, source) {
                out.push(Symbol {
                    name,
                    kind: SymbolKind::Class,
                    signature: header_line(node, source),
                    line,
                });
            }
        }
        "interface_declaration" if is_exported(node) => {
            if let Some(name) = named_text(node, source) {
                out.push(Symbol {
                    name,
                    kind: SymbolKind::Interface,
                    signature: header_line(node, source),
                    line,
                });
            }
        }
        "type_alias_declaration" if is_exported(node) => {
            if let Some(name) = named_text(node, source) {
                out.push(Symbol {
                    name,
                    kind: SymbolKind::Type,
                    signature: header_line(node, source),
                    line,
                });
            }
        }
        "enum_declaration" if is_exported(node) => {
            if let Some(name) = named_text(node, source) {
                out.push(Symbol {
                    name,
                    kind: SymbolKind::Enum,
                    signature: header_line(node, source),
                    line,
                });
            }
        }
        _ => {}
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk_typescript(child, source, out);
    }
}

/// Dependency-free fallback: a line-oriented scan for common
/// declaration-opening keywords. Used for any extension without a vendored
/// grammar, and as a parse-failure fallback for the grammars above.
fn digest_heuristic(source: &str) -> Vec<Symbol> {
    let keyword_kind = [
        ("export function ", SymbolKind::Function),
        ("function ", SymbolKind::Function),
        ("export class ", SymbolKind::Class),
        ("class ", SymbolKind::Class),
        ("export interface ", SymbolKind::Interface),
        ("interface ", SymbolKind::Interface),
        ("export enum ", SymbolKind::Enum),
        ("enum ", SymbolKind::Enum),
        ("export type ", SymbolKind::Type),
        ("export const ", SymbolKind::Variable),
        ("export let ", SymbolKind::Variable),
    ];

    let mut out = Vec::new();
    for (idx, raw_line) in source.lines().enumerate() {
        let line = raw_line.trim_start();
        for (keyword, kind) in &keyword_kind {
            if let Some(rest) = line.strip_prefix(keyword) {
                let name = rest
                    .split(|c: char| !(c.is_alphanumeric() || c == '_'))
                    .next()
                    .unwrap_or("")
                    .to_string();
                if !name.is_empty() {
                    out.push(Symbol {
                        name,
                        kind: *kind,
                        signature: line.trim_end_matches('{').trim().to_string(),
                        line: idx + 1,
                    });
                }
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_digest_keeps_only_public_items_in_signature_order() {
        let source = r#"
pub struct Widget { x: i32 }
struct Hidden;
pub fn build() -> Widget { Widget { x: 0 } }
pub enum Mode { A, B }
"#;
        let symbols = digest_symbols("widget.rs", source, &DigestOptions::default());
        let names: Vec<_> = symbols.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"Widget"));
        assert!(!names.contains(&"Hidden"));
        assert!(names.contains(&"build"));
        assert!(names.contains(&"Mode"));
        // types before enums before functions
        let widget_idx = names.iter().position(|n| *n == "Widget").unwrap();
        let mode_idx = names.iter().position(|n| *n == "Mode").unwrap();
        let build_idx = names.iter().position(|n| *n == "build").unwrap();
        assert!(widget_idx < mode_idx);
        assert!(mode_idx < build_idx);
    }

    #[test]
    fn heuristic_extracts_exported_declarations_for_unknown_extensions() {
        let source = "export function greet(name) {\n  return name;\n}\n";
        let symbols = digest_symbols("greet.mjs", source, &DigestOptions::default());
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "greet");
        assert_eq!(symbols[0].kind, SymbolKind::Function);
    }

    #[test]
    fn digest_text_groups_by_kind() {
        let source = "pub struct A;\npub struct B;\npub fn f() {}\n";
        let text = digest("x.rs", source, &DigestOptions::default());
        assert!(text.contains("## Type"));
        let type_pos = text.find("## Type").unwrap();
        let fn_pos = text.find("## Function").unwrap();
        assert!(type_pos < fn_pos);
    }
}

//! Helpers shared by the passes.

use dexcloak_core::patterns::LS;
use rand::rngs::StdRng;
use rand::Rng;

const IDENT_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Delimiter line that starts and ends a multi-line compound template.
pub const COMPOUND_DELIM: &str = "*";

/// Random identifier of `len` letters, valid in class names, package
/// segments and jump labels alike.
pub fn random_ident(rng: &mut StdRng, len: usize) -> String {
    (0..len)
        .map(|_| IDENT_CHARSET[rng.random_range(0..IDENT_CHARSET.len())] as char)
        .collect()
}

/// Parses a junk template resource into entries. A plain line is an entry
/// of its own; lines between two `*` delimiters form one compound entry.
/// Every entry keeps a line terminator on each of its lines.
pub fn parse_templates(text: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        if line != COMPOUND_DELIM {
            entries.push(format!("{line}{LS}"));
            continue;
        }
        let mut compound = String::new();
        for inner in lines.by_ref() {
            if inner == COMPOUND_DELIM {
                break;
            }
            compound.push_str(inner);
            compound.push_str(LS);
        }
        entries.push(compound);
    }
    entries
}

/// Parses a template resource made only of `*`-delimited blocks, each block
/// a list of lines.
pub fn parse_template_blocks(text: &str) -> Vec<Vec<String>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for line in text.lines() {
        if line == COMPOUND_DELIM {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line.to_string());
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn random_ident_is_seed_stable() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let x = random_ident(&mut a, 16);
        assert_eq!(x, random_ident(&mut b, 16));
        assert_eq!(x.len(), 16);
        assert!(x.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn template_entries_and_blocks() {
        let text = "one VV, VV\n*\njump VV, VV, :TT\n:TT\n*\ntwo VV, VV\n";
        let entries = parse_templates(text);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], "one VV, VV\n");
        assert_eq!(entries[1], "jump VV, VV, :TT\n:TT\n");

        let blocks = parse_template_blocks("nop\nnop\n*\ngoto :j\n:j\n*\n");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1], vec!["goto :j", ":j"]);
    }
}

use ahash::{AHashMap, AHashSet};
use std::hash::Hasher as _;
use twox_hash::XxHash64;

use super::fingerprint::Fingerprints;
use super::tokenize::{TokenStream, TOK_PUNCT_BASE};
use crate::config::RunConfig;
use crate::error::Error;
use crate::storage::models::EvidenceKind;

/// Marker separating child-subtree hashes from plain tokens inside a
/// node's hash representation.
const CHILD_MARKER: u64 = u64::MAX;

/// At most this many occurrences per shared fingerprint hash are used to
/// seed token-level matches, bounding degenerate inputs.
const MAX_SEED_POSITIONS: usize = 8;

/// Cap on token-level evidence rows per pair; structural rows are bounded
/// by the non-overlap claim discipline already.
const MAX_TOKEN_EVIDENCE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Module,
    Function,
    Type,
    Conditional,
    Loop,
    Switch,
    Try,
    Block,
}

impl NodeKind {
    fn code(self) -> u64 {
        match self {
            NodeKind::Module => 1,
            NodeKind::Function => 2,
            NodeKind::Type => 3,
            NodeKind::Conditional => 4,
            NodeKind::Loop => 5,
            NodeKind::Switch => 6,
            NodeKind::Try => 7,
            NodeKind::Block => 8,
        }
    }

    fn from_keyword(code: u32) -> NodeKind {
        match code {
            114 | 115 => NodeKind::Function,
            116..=120 | 132 => NodeKind::Type,
            100 | 101 => NodeKind::Conditional,
            102..=104 | 131 => NodeKind::Loop,
            105 | 130 => NodeKind::Switch,
            110..=112 => NodeKind::Try,
            _ => NodeKind::Block,
        }
    }
}

/// One node in the arena tree. Token span is `[start_tok, end_tok)`;
/// children are arena indices, never owning pointers.
#[derive(Debug, Clone)]
pub struct AstNode {
    pub kind: NodeKind,
    pub start_tok: usize,
    pub end_tok: usize,
    pub depth: u32,
    pub children: Vec<usize>,
}

#[derive(Debug)]
pub struct Tree {
    pub nodes: Vec<AstNode>,
    pub root: usize,
}

impl Tree {
    pub fn node_size(&self, id: usize) -> usize {
        let node = &self.nodes[id];
        node.end_tok - node.start_tok
    }
}

/// Build the brace-nesting tree over a token stream.
///
/// A synthetic module root spans the whole file; each `{ … }` region
/// becomes a node whose kind is taken from the construct keyword seen
/// before the opening brace. A stray closing brace is tolerated; an
/// unclosed opening brace at end of input is a parse failure.
pub fn parse_tree(ts: &TokenStream) -> Result<Tree, Error> {
    let open = TOK_PUNCT_BASE + u32::from(b'{');
    let close = TOK_PUNCT_BASE + u32::from(b'}');
    let semi = TOK_PUNCT_BASE + u32::from(b';');

    let mut nodes = vec![AstNode {
        kind: NodeKind::Module,
        start_tok: 0,
        end_tok: ts.len(),
        depth: 0,
        children: Vec::new(),
    }];
    let mut stack: Vec<usize> = Vec::new();
    let mut pending_kind = NodeKind::Block;

    for (idx, &code) in ts.codes.iter().enumerate() {
        if code == open {
            let node_id = nodes.len();
            nodes.push(AstNode {
                kind: pending_kind,
                start_tok: idx,
                end_tok: idx + 1,
                depth: stack.len() as u32 + 1,
                children: Vec::new(),
            });
            let parent = stack.last().copied().unwrap_or(0);
            nodes[parent].children.push(node_id);
            stack.push(node_id);
            pending_kind = NodeKind::Block;
        } else if code == close {
            if let Some(node_id) = stack.pop() {
                nodes[node_id].end_tok = idx + 1;
            }
            pending_kind = NodeKind::Block;
        } else if code == semi {
            pending_kind = NodeKind::Block;
        } else if (100..TOK_PUNCT_BASE).contains(&code) {
            let kind = NodeKind::from_keyword(code);
            if kind != NodeKind::Block {
                pending_kind = kind;
            }
        }
    }

    if !stack.is_empty() {
        return Err(Error::ParseFailure(format!(
            "unbalanced braces: {} block(s) left open at end of input",
            stack.len()
        )));
    }

    Ok(Tree { nodes, root: 0 })
}

/// Hash every subtree bottom-up. A node's hash covers its kind, its
/// interior tokens, and its children's hashes (child token spans replaced
/// by the child hash), so structurally identical subtrees hash identically
/// regardless of source position.
fn subtree_hashes(tree: &Tree, codes: &[u32]) -> Vec<u64> {
    let mut hashes = vec![0u64; tree.nodes.len()];
    let mut order: Vec<usize> = (0..tree.nodes.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(tree.nodes[i].depth));

    for node_id in order {
        let node = &tree.nodes[node_id];
        // Brace nodes hash their interior; the module root has no braces.
        let (lo, hi) = if node.kind == NodeKind::Module {
            (node.start_tok, node.end_tok)
        } else {
            (node.start_tok + 1, node.end_tok.saturating_sub(1))
        };

        let mut children: Vec<usize> = node.children.clone();
        children.sort_by_key(|&c| tree.nodes[c].start_tok);

        let mut hasher = XxHash64::with_seed(0);
        hasher.write_u64(node.kind.code());
        let mut idx = lo;
        for child_id in children {
            let child = &tree.nodes[child_id];
            while idx < child.start_tok && idx < hi {
                hasher.write_u64(u64::from(codes[idx]));
                idx += 1;
            }
            hasher.write_u64(CHILD_MARKER);
            hasher.write_u64(hashes[child_id]);
            idx = child.end_tok;
        }
        while idx < hi {
            hasher.write_u64(u64::from(codes[idx]));
            idx += 1;
        }
        hashes[node_id] = hasher.finish();
    }

    hashes
}

/// One matched region pair, with byte offsets into the original sources.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceSpan {
    pub kind: EvidenceKind,
    pub a_start: u32,
    pub a_end: u32,
    pub b_start: u32,
    pub b_end: u32,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct PairComparison {
    pub ast_score: f64,
    pub evidence: Vec<EvidenceSpan>,
}

fn byte_span(ts: &TokenStream, start_tok: usize, end_tok: usize) -> (u32, u32) {
    if start_tok >= end_tok || end_tok > ts.len() {
        return (0, 0);
    }
    (ts.spans[start_tok].0, ts.spans[end_tok - 1].1)
}

/// Longest common token run around a matching k-gram seed. Returns the
/// extended (start_a, start_b, len), or None if the seed does not match.
fn maximal_match(
    a: &[u32],
    a_pos: usize,
    b: &[u32],
    b_pos: usize,
    k: usize,
) -> Option<(usize, usize, usize)> {
    if k == 0 || a_pos.checked_add(k)? > a.len() || b_pos.checked_add(k)? > b.len() {
        return None;
    }
    if a[a_pos..a_pos + k] != b[b_pos..b_pos + k] {
        return None;
    }

    let backward = a[..a_pos]
        .iter()
        .rev()
        .zip(b[..b_pos].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let forward = a[a_pos + k..]
        .iter()
        .zip(&b[b_pos + k..])
        .take_while(|(x, y)| *x == *y)
        .count();

    Some((a_pos - backward, b_pos - backward, backward + k + forward))
}

/// Structurally compare two tokenized files.
///
/// Matching is greedy largest-subtree-first: once a token range is claimed
/// by a match, smaller matches inside it are skipped, so evidence never
/// reports the same code region at multiple granularities. The score is
/// the claimed token weight over the combined size of both trees.
pub fn compare_pair(
    a: &TokenStream,
    fp_a: &Fingerprints,
    b: &TokenStream,
    fp_b: &Fingerprints,
    config: &RunConfig,
) -> Result<PairComparison, Error> {
    let tree_a = parse_tree(a)?;
    let tree_b = parse_tree(b)?;
    let hashes_a = subtree_hashes(&tree_a, &a.codes);
    let hashes_b = subtree_hashes(&tree_b, &b.codes);

    let eligible = |tree: &Tree, id: usize| {
        let size = tree.node_size(id);
        size >= config.min_subtree_tokens || (id == tree.root && size > 0)
    };

    // hash → (occurrences in a, occurrences in b), in document order.
    let mut by_hash: AHashMap<u64, (Vec<usize>, Vec<usize>)> = AHashMap::new();
    for (id, &hash) in hashes_a.iter().enumerate() {
        if eligible(&tree_a, id) {
            by_hash.entry(hash).or_default().0.push(id);
        }
    }
    for (id, &hash) in hashes_b.iter().enumerate() {
        if eligible(&tree_b, id) {
            by_hash.entry(hash).or_default().1.push(id);
        }
    }

    // Largest subtrees first; hash as the deterministic tie-break.
    let mut shared: Vec<(usize, u64)> = by_hash
        .iter()
        .filter(|(_, (in_a, in_b))| !in_a.is_empty() && !in_b.is_empty())
        .map(|(&hash, (in_a, _))| (tree_a.node_size(in_a[0]), hash))
        .collect();
    shared.sort_by(|x, y| y.0.cmp(&x.0).then(x.1.cmp(&y.1)));

    let mut claimed_a = vec![false; a.len()];
    let mut claimed_b = vec![false; b.len()];
    let unclaimed = |claimed: &[bool], lo: usize, hi: usize| !claimed[lo..hi].iter().any(|&c| c);
    let claim = |claimed: &mut [bool], lo: usize, hi: usize| {
        claimed[lo..hi].iter_mut().for_each(|c| *c = true);
    };

    let mut evidence: Vec<EvidenceSpan> = Vec::new();
    let mut matched_weight = 0usize;

    for (_, hash) in shared {
        let (in_a, in_b) = &by_hash[&hash];
        let free_a: Vec<usize> = in_a
            .iter()
            .copied()
            .filter(|&id| {
                let n = &tree_a.nodes[id];
                unclaimed(&claimed_a, n.start_tok, n.end_tok)
            })
            .collect();
        let free_b: Vec<usize> = in_b
            .iter()
            .copied()
            .filter(|&id| {
                let n = &tree_b.nodes[id];
                unclaimed(&claimed_b, n.start_tok, n.end_tok)
            })
            .collect();

        for (&na, &nb) in free_a.iter().zip(free_b.iter()) {
            let node_a = &tree_a.nodes[na];
            let node_b = &tree_b.nodes[nb];
            claim(&mut claimed_a, node_a.start_tok, node_a.end_tok);
            claim(&mut claimed_b, node_b.start_tok, node_b.end_tok);

            let size_a = tree_a.node_size(na);
            let size_b = tree_b.node_size(nb);
            matched_weight += size_a + size_b;

            let (a_start, a_end) = byte_span(a, node_a.start_tok, node_a.end_tok);
            let (b_start, b_end) = byte_span(b, node_b.start_tok, node_b.end_tok);
            evidence.push(EvidenceSpan {
                kind: EvidenceKind::Ast,
                a_start,
                a_end,
                b_start,
                b_end,
                weight: (size_a + size_b) as f64,
            });
        }
    }

    let combined = a.len() + b.len();
    let ast_score = if combined == 0 {
        0.0
    } else {
        matched_weight as f64 / combined as f64
    };

    // Token-level evidence: maximal matches seeded at shared winnowing
    // fingerprint positions.
    let mut pos_b: AHashMap<u64, Vec<u32>> = AHashMap::new();
    for &(hash, pos) in &fp_b.positions {
        let entry = pos_b.entry(hash).or_default();
        if entry.len() < MAX_SEED_POSITIONS {
            entry.push(pos);
        }
    }
    let mut seen: AHashSet<(u32, u32, usize)> = AHashSet::new();
    let mut token_rows = 0usize;
    'seeds: for &(hash, pa) in &fp_a.positions {
        let Some(b_positions) = pos_b.get(&hash) else {
            continue;
        };
        for &pb in b_positions {
            let Some((sa, sb, len)) =
                maximal_match(&a.codes, pa as usize, &b.codes, pb as usize, config.k)
            else {
                continue;
            };
            if !seen.insert((sa as u32, sb as u32, len)) {
                continue;
            }
            let (a_start, a_end) = byte_span(a, sa, sa + len);
            let (b_start, b_end) = byte_span(b, sb, sb + len);
            evidence.push(EvidenceSpan {
                kind: EvidenceKind::Token,
                a_start,
                a_end,
                b_start,
                b_end,
                weight: len as f64,
            });
            token_rows += 1;
            if token_rows >= MAX_TOKEN_EVIDENCE {
                break 'seeds;
            }
        }
    }

    evidence.sort_by(|x, y| {
        (x.kind.as_str(), x.a_start, x.b_start, x.a_end)
            .cmp(&(y.kind.as_str(), y.a_start, y.b_start, y.a_end))
    });

    Ok(PairComparison {
        ast_score,
        evidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fingerprint::winnow;
    use crate::pipeline::tokenize::tokenize;

    fn analyzed(source: &str, config: &RunConfig) -> (TokenStream, Fingerprints) {
        let ts = tokenize(source.as_bytes(), "rust").unwrap();
        let fp = winnow(&ts.codes, config.k, config.w);
        (ts, fp)
    }

    const PROGRAM: &str = r#"
fn gcd(a, b) {
    while (b != 0) {
        let t = b;
        b = a % b;
        a = t;
    }
    return a;
}

fn lcm(a, b) {
    return a / gcd(a, b) * b;
}
"#;

    #[test]
    fn parse_builds_nested_blocks_with_kinds() {
        let ts = tokenize(PROGRAM.as_bytes(), "rust").unwrap();
        let tree = parse_tree(&ts).unwrap();
        // Module root + two function bodies + one while body.
        assert_eq!(tree.nodes.len(), 4);
        assert_eq!(tree.nodes[tree.root].kind, NodeKind::Module);
        let kinds: Vec<NodeKind> = tree.nodes[1..].iter().map(|n| n.kind).collect();
        assert!(kinds.contains(&NodeKind::Function));
        assert!(kinds.contains(&NodeKind::Loop));
    }

    #[test]
    fn unclosed_brace_is_a_parse_failure() {
        let ts = tokenize(b"fn f() { if (x) { y(); }", "rust").unwrap();
        let err = parse_tree(&ts).unwrap_err();
        assert!(matches!(err, Error::ParseFailure(_)));
    }

    #[test]
    fn stray_closing_brace_is_tolerated() {
        let ts = tokenize(b"} fn f() { }", "rust").unwrap();
        assert!(parse_tree(&ts).is_ok());
    }

    #[test]
    fn identical_sources_score_one_with_full_coverage() {
        let config = RunConfig::default();
        let (ts_a, fp_a) = analyzed(PROGRAM, &config);
        let (ts_b, fp_b) = analyzed(PROGRAM, &config);

        let cmp = compare_pair(&ts_a, &fp_a, &ts_b, &fp_b, &config).unwrap();
        assert!((cmp.ast_score - 1.0).abs() < f64::EPSILON);

        let ast_rows: Vec<&EvidenceSpan> = cmp
            .evidence
            .iter()
            .filter(|e| e.kind == EvidenceKind::Ast)
            .collect();
        // The module roots match, claiming everything in one span.
        assert_eq!(ast_rows.len(), 1);
        assert_eq!(ast_rows[0].a_start, ts_a.spans[0].0);
        assert_eq!(ast_rows[0].a_end, ts_a.spans[ts_a.len() - 1].1);
    }

    #[test]
    fn renamed_identifiers_still_match_fully() {
        let renamed = PROGRAM
            .replace("gcd", "euclid")
            .replace('a', "x")
            .replace('b', "y");
        let config = RunConfig::default();
        let (ts_a, fp_a) = analyzed(PROGRAM, &config);
        let (ts_b, fp_b) = analyzed(&renamed, &config);

        let cmp = compare_pair(&ts_a, &fp_a, &ts_b, &fp_b, &config).unwrap();
        assert!((cmp.ast_score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unrelated_sources_share_nothing() {
        let other = r#"
class Queue {
    push(item) { this.items[this.tail++] = item; }
}
"#;
        let config = RunConfig::default();
        let (ts_a, fp_a) = analyzed(PROGRAM, &config);
        let (ts_b, fp_b) = analyzed(other, &config);

        let cmp = compare_pair(&ts_a, &fp_a, &ts_b, &fp_b, &config).unwrap();
        assert_eq!(cmp.ast_score, 0.0);
        assert!(cmp.evidence.is_empty());
    }

    #[test]
    fn copied_function_in_different_surroundings_scores_partially() {
        let partial = format!(
            "{}\nfn unrelated(n) {{ let s = 0; for (i = 0; i < n; i = i + 1) {{ s = s + i * i; }} return s; }}\n",
            PROGRAM
        );
        let config = RunConfig::default();
        let (ts_a, fp_a) = analyzed(PROGRAM, &config);
        let (ts_b, fp_b) = analyzed(&partial, &config);

        let cmp = compare_pair(&ts_a, &fp_a, &ts_b, &fp_b, &config).unwrap();
        assert!(cmp.ast_score > 0.0, "copied bodies must contribute");
        assert!(cmp.ast_score < 1.0, "extra code must dilute the score");
        assert!(cmp
            .evidence
            .iter()
            .any(|e| e.kind == EvidenceKind::Ast));
    }

    #[test]
    fn ast_evidence_never_overlaps_within_a_file() {
        let doubled = format!("{PROGRAM}\n{PROGRAM}");
        let config = RunConfig::default();
        let (ts_a, fp_a) = analyzed(&doubled, &config);
        let (ts_b, fp_b) = analyzed(PROGRAM, &config);

        let cmp = compare_pair(&ts_a, &fp_a, &ts_b, &fp_b, &config).unwrap();
        let mut ast_rows: Vec<(u32, u32)> = cmp
            .evidence
            .iter()
            .filter(|e| e.kind == EvidenceKind::Ast)
            .map(|e| (e.a_start, e.a_end))
            .collect();
        ast_rows.sort_unstable();
        for pair in ast_rows.windows(2) {
            assert!(
                pair[0].1 <= pair[1].0,
                "overlapping AST evidence in file A: {:?}",
                pair
            );
        }
    }

    #[test]
    fn evidence_spans_stay_within_file_bounds() {
        let config = RunConfig::default();
        let (ts_a, fp_a) = analyzed(PROGRAM, &config);
        let (ts_b, fp_b) = analyzed(PROGRAM, &config);

        let cmp = compare_pair(&ts_a, &fp_a, &ts_b, &fp_b, &config).unwrap();
        assert!(!cmp.evidence.is_empty());
        for span in &cmp.evidence {
            assert!(span.a_start < span.a_end);
            assert!(span.b_start < span.b_end);
            assert!(span.a_end <= ts_a.byte_len);
            assert!(span.b_end <= ts_b.byte_len);
        }
    }

    #[test]
    fn token_evidence_is_emitted_for_shared_runs() {
        let config = RunConfig::default();
        let (ts_a, fp_a) = analyzed(PROGRAM, &config);
        let (ts_b, fp_b) = analyzed(PROGRAM, &config);

        let cmp = compare_pair(&ts_a, &fp_a, &ts_b, &fp_b, &config).unwrap();
        let token_rows: Vec<&EvidenceSpan> = cmp
            .evidence
            .iter()
            .filter(|e| e.kind == EvidenceKind::Token)
            .collect();
        assert!(!token_rows.is_empty());
        for row in token_rows {
            assert!(row.weight >= config.k as f64);
        }
    }
}
